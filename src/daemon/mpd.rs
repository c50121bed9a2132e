//! # MPD Connection
//!
//! [`Daemon`] over a TCP or unix socket connection to MPD, built on the
//! [`mpd`](::mpd) client crate.
//!
//! The client owns the socket for regular commands. A second handle on the same
//! socket carries the idle cycle and the few commands the client has no call for
//! (`listallinfo`, `listplaylistinfo`, `searchaddpl`, `config`, `channels`,
//! `sticker list`, `sticker find`). Both sides only ever exchange complete
//! request/response pairs, so neither leaves unread bytes for the other.
//!
//! Idle polling uses the socket read timeout: [`Daemon::poll_idle`] waits for the
//! first byte of the idle response without consuming it.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use ::mpd::error::Error as ClientError;
use ::mpd::{Client, Query, State, Term};
use chrono::DateTime;
use log::{debug, info, trace, warn};

use crate::config::ConnectionSettings;
use crate::daemon::{
    Connector, Daemon, PlayState, SearchQuery, Song, SongSource, Stats, Status, Subsystem,
};
use crate::error::{EngineError, Result};

/// Subsystems the engine listens to while idle
const IDLE_COMMAND: &str =
    "idle database stored_playlist playlist player mixer output options update subscription";

type ClientResult<T> = std::result::Result<T, ClientError>;

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn try_clone(&self) -> io::Result<Stream> {
        match self {
            Stream::Tcp(s) => s.try_clone().map(Stream::Tcp),
            #[cfg(unix)]
            Stream::Unix(s) => s.try_clone().map(Stream::Unix),
        }
    }

    fn set_timeouts(&self, read: Duration, write: Duration) -> io::Result<()> {
        self.set_read_timeout(read)?;
        match self {
            Stream::Tcp(s) => s.set_write_timeout(Some(write)),
            #[cfg(unix)]
            Stream::Unix(s) => s.set_write_timeout(Some(write)),
        }
    }

    fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(Some(timeout)),
            #[cfg(unix)]
            Stream::Unix(s) => s.set_read_timeout(Some(timeout)),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// Quote an argument for the command line
pub fn quote(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Message part of an `ACK [50@0] {sticker} no such sticker` line
pub fn parse_ack(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("ACK ")?;
    Some(rest.split_once("} ").map(|(_, msg)| msg).unwrap_or(rest))
}

/// Unix seconds for an RFC 3339 timestamp like `2024-03-04T12:30:00Z`
pub fn parse_timestamp(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|time| time.timestamp())
}

fn seconds(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

/// Incrementally assembles songs from `key: value` pairs
#[derive(Default)]
struct SongBuilder {
    current: Option<Song>,
}

impl SongBuilder {
    /// Feed one pair; returns the previous song once a new entry begins
    fn feed(&mut self, key: &str, value: &str) -> Option<Song> {
        match key {
            "file" => self.current.replace(Song::new(value)),
            "directory" | "playlist" => self.current.take(),
            _ => {
                if let Some(song) = self.current.as_mut() {
                    match key {
                        "Id" => song.id = value.parse().ok(),
                        "duration" => {
                            song.duration = value.parse::<f64>().map(|d| d as i64).unwrap_or(0)
                        }
                        "Time" if song.duration == 0 => {
                            song.duration = value.parse().unwrap_or(0)
                        }
                        "Last-Modified" => {
                            song.last_modified = parse_timestamp(value).unwrap_or(0)
                        }
                        "Pos" | "Prio" | "Range" | "Format" | "Time" | "Added" => {}
                        tag => {
                            song.tags
                                .entry(tag.to_string())
                                .or_default()
                                .push(value.to_string());
                        }
                    }
                }
                None
            }
        }
    }

    fn finish(&mut self) -> Option<Song> {
        self.current.take()
    }
}

fn song_from_client(song: ::mpd::Song) -> Song {
    let mut converted = Song::new(song.file);
    converted.id = song.place.as_ref().map(|place| place.id.0);
    converted.duration = song.duration.map(seconds).unwrap_or(0);
    converted.last_modified = song
        .last_mod
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(0);
    if let Some(title) = song.title {
        converted.tags.entry("Title".to_string()).or_default().push(title);
    }
    for (tag, value) in song.tags.iter() {
        converted
            .tags
            .entry(tag.to_string())
            .or_default()
            .push(value.to_string());
    }
    converted
}

fn status_from_client(status: ::mpd::Status) -> Status {
    let song = status.song.as_ref();
    Status {
        state: match status.state {
            State::Play => PlayState::Play,
            State::Pause => PlayState::Pause,
            State::Stop => PlayState::Stop,
        },
        volume: i32::from(status.volume),
        song_pos: song.map(|place| place.pos),
        song_id: song.map(|place| place.id.0),
        next_song_id: status.nextsong.as_ref().map(|place| place.id.0),
        queue_length: status.queue_len,
        queue_version: status.queue_version,
        crossfade: status.crossfade.map(seconds).unwrap_or(0),
        elapsed: status
            .elapsed
            .or(status.time.map(|(elapsed, _)| elapsed))
            .map(seconds)
            .unwrap_or(0),
        total: status.time.map(|(_, total)| seconds(total)).unwrap_or(0),
        updating_db: status.updating_db,
    }
}

fn values_of(pairs: Vec<(String, String)>, key: &str) -> Vec<String> {
    pairs
        .into_iter()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v)
        .collect()
}

/// A bare song value, the path argument form the client takes
fn song_path(uri: &str) -> ::mpd::Song {
    ::mpd::Song {
        file: uri.to_string(),
        ..Default::default()
    }
}

/// Live session with an MPD server
pub struct MpdConnection {
    client: Client<Stream>,
    /// Second handle on the client's socket
    raw: BufReader<Stream>,
    version: (u32, u32, u32),
    timeout: Duration,
    idle: bool,
    broken: bool,
}

impl MpdConnection {
    /// Connect and read the greeting
    ///
    /// # Errors
    ///
    /// [`EngineError::Connection`] if the socket can not be opened or the peer
    /// does not greet like MPD.
    pub fn open(settings: &ConnectionSettings) -> Result<Self> {
        let stream = if settings.is_socket() {
            Self::open_socket(&settings.host)?
        } else {
            Self::open_tcp(&settings.host, settings.port, settings.timeout)?
        };
        let timeout = settings.timeout;
        stream
            .set_timeouts(timeout, timeout)
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        let raw = stream
            .try_clone()
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        let client = Client::new(stream).map_err(|e| {
            EngineError::Connection(format!("unexpected greeting from {}: {e}", settings.host))
        })?;
        let ::mpd::Version(major, minor, patch) = client.version;
        let version = (u32::from(major), u32::from(minor), u32::from(patch));
        info!(
            "Connected to MPD {major}.{minor}.{patch} at {}",
            settings.host
        );
        Ok(Self {
            client,
            raw: BufReader::new(raw),
            version,
            timeout,
            idle: false,
            broken: false,
        })
    }

    #[cfg(unix)]
    fn open_socket(path: &str) -> Result<Stream> {
        UnixStream::connect(path)
            .map(Stream::Unix)
            .map_err(|e| EngineError::Connection(format!("{path}: {e}")))
    }

    #[cfg(not(unix))]
    fn open_socket(path: &str) -> Result<Stream> {
        Err(EngineError::Connection(format!(
            "{path}: unix sockets are not supported on this platform"
        )))
    }

    fn open_tcp(host: &str, port: u16, timeout: Duration) -> Result<Stream> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| EngineError::Connection(format!("{host}:{port}: {e}")))?;
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(Stream::Tcp(stream)),
                Err(e) => {
                    debug!("Connecting to {addr} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(EngineError::Connection(match last_error {
            Some(e) => format!("{host}:{port}: {e}"),
            None => format!("{host}:{port}: no address"),
        }))
    }

    fn check_usable(&self) -> Result<()> {
        if self.broken {
            return Err(EngineError::Connection("connection is broken".to_string()));
        }
        Ok(())
    }

    /// Server rejections keep the session; anything else breaks it
    fn client_error(&mut self, command: &str, e: ClientError) -> EngineError {
        match e {
            ClientError::Server(server) => {
                debug!("MPD rejected {command}: {}", server.detail);
                EngineError::protocol(command, server.detail)
            }
            other => {
                self.broken = true;
                EngineError::Connection(format!("{command}: {other}"))
            }
        }
    }

    /// Run one command through the client
    fn call<T>(
        &mut self,
        command: &str,
        f: impl FnOnce(&mut Client<Stream>) -> ClientResult<T>,
    ) -> Result<T> {
        self.check_usable()?;
        trace!("> {command}");
        f(&mut self.client).map_err(|e| self.client_error(command, e))
    }

    fn io_error(&mut self, e: io::Error) -> EngineError {
        self.broken = true;
        EngineError::Connection(e.to_string())
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        match self.raw.read_line(&mut line) {
            Ok(0) => {
                self.broken = true;
                Err(EngineError::Connection("connection closed by MPD".to_string()))
            }
            Ok(_) => {
                line.truncate(line.trim_end_matches(['\r', '\n']).len());
                Ok(line)
            }
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn send(&mut self, command: &str, args: &[&str]) -> Result<()> {
        self.check_usable()?;
        let mut line = command.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(&quote(arg));
        }
        trace!("> {line}");
        line.push('\n');
        let stream = self.raw.get_mut();
        if let Err(e) = stream.write_all(line.as_bytes()).and_then(|_| stream.flush()) {
            return Err(self.io_error(e));
        }
        Ok(())
    }

    /// Read one response from the raw handle, handing each pair to `on_pair`
    fn read_response(
        &mut self,
        command: &str,
        mut on_pair: impl FnMut(String, String),
    ) -> Result<()> {
        loop {
            let line = self.read_line()?;
            if line == "OK" {
                return Ok(());
            }
            if let Some(message) = parse_ack(&line) {
                debug!("MPD rejected {command}: {message}");
                return Err(EngineError::protocol(command, message));
            }
            match line.split_once(": ") {
                Some((key, value)) => on_pair(key.to_string(), value.to_string()),
                None => warn!("Ignoring malformed line from MPD: {line:?}"),
            }
        }
    }

    fn run(&mut self, command: &str, args: &[&str]) -> Result<Vec<(String, String)>> {
        self.send(command, args)?;
        let mut pairs = Vec::new();
        self.read_response(command, |k, v| pairs.push((k, v)))?;
        Ok(pairs)
    }

    fn run_ok(&mut self, command: &str, args: &[&str]) -> Result<()> {
        self.run(command, args).map(|_| ())
    }

    fn stream_songs(&mut self, command: &str, args: &[&str], visit: &mut dyn FnMut(Song)) -> Result<()> {
        self.send(command, args)?;
        let mut builder = SongBuilder::default();
        self.read_response(command, |k, v| {
            if let Some(song) = builder.feed(&k, &v) {
                visit(song);
            }
        })?;
        if let Some(song) = builder.finish() {
            visit(song);
        }
        Ok(())
    }
}

impl Daemon for MpdConnection {
    fn version(&self) -> (u32, u32, u32) {
        self.version
    }

    fn password(&mut self, password: &str) -> Result<()> {
        self.call("password", |c| c.login(password))
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        let result = self.raw.get_ref().set_timeouts(timeout, timeout);
        result.map_err(|e| self.io_error(e))
    }

    fn clear_error(&mut self) -> Result<()> {
        self.check_usable()
    }

    fn commands(&mut self) -> Result<Vec<String>> {
        self.call("commands", |c| c.commands())
    }

    fn tag_types(&mut self) -> Result<Vec<String>> {
        self.call("tagtypes", |c| c.tagtypes())
    }

    fn channels(&mut self) -> Result<Vec<String>> {
        Ok(values_of(self.run("channels", &[])?, "channel"))
    }

    fn music_directory(&mut self) -> Result<Option<String>> {
        Ok(values_of(self.run("config", &[])?, "music_directory")
            .into_iter()
            .next())
    }

    fn status(&mut self) -> Result<Status> {
        self.call("status", |c| c.status()).map(status_from_client)
    }

    fn current_song(&mut self) -> Result<Option<Song>> {
        Ok(self
            .call("currentsong", |c| c.currentsong())?
            .map(song_from_client))
    }

    fn queue_song(&mut self, id: u32) -> Result<Option<Song>> {
        Ok(self
            .call("playlistid", |c| c.playlistid(::mpd::Id(id)))?
            .map(song_from_client))
    }

    fn queue_songs(&mut self) -> Result<Vec<Song>> {
        Ok(self
            .call("playlistinfo", |c| c.queue())?
            .into_iter()
            .map(song_from_client)
            .collect())
    }

    fn stats(&mut self) -> Result<Stats> {
        let stats = self.call("stats", |c| c.stats())?;
        Ok(Stats {
            songs: u64::from(stats.songs),
            db_update: seconds(stats.db_update),
        })
    }

    fn play(&mut self) -> Result<()> {
        self.call("play", |c| c.play())
    }

    fn pause(&mut self) -> Result<()> {
        self.call("pause", |c| c.pause(true))
    }

    fn stop(&mut self) -> Result<()> {
        self.call("stop", |c| c.stop())
    }

    fn next(&mut self) -> Result<()> {
        self.call("next", |c| c.next())
    }

    fn previous(&mut self) -> Result<()> {
        self.call("previous", |c| c.prev())
    }

    fn set_volume(&mut self, volume: u32) -> Result<()> {
        let volume = i8::try_from(volume)
            .ok()
            .filter(|v| *v <= 100)
            .ok_or_else(|| EngineError::Validation(format!("volume {volume} out of range")))?;
        self.call("setvol", |c| c.volume(volume))
    }

    fn add(&mut self, uri: &str) -> Result<()> {
        self.call("add", |c| c.push(song_path(uri))).map(|_| ())
    }

    fn search_add(&mut self, tag: &str, value: &str) -> Result<()> {
        self.call("findadd", |c| {
            c.findadd(Query::new().and(Term::Tag(tag.into()), value))
        })
    }

    fn clear_queue(&mut self) -> Result<()> {
        self.call("clear", |c| c.clear())
    }

    fn update_database(&mut self) -> Result<u32> {
        self.call("update", |c| c.update())
    }

    fn for_each_song(&mut self, source: &SongSource, visit: &mut dyn FnMut(Song)) -> Result<()> {
        match source {
            SongSource::Library => self.stream_songs("listallinfo", &[], visit),
            SongSource::Playlist(name) => self.stream_songs("listplaylistinfo", &[name], visit),
        }
    }

    fn for_each_tag_value(&mut self, tag: &str, visit: &mut dyn FnMut(String)) -> Result<()> {
        let values = self.call("list", |c| c.list(&Term::Tag(tag.into()), &Query::new()))?;
        values.into_iter().for_each(visit);
        Ok(())
    }

    fn playlists(&mut self) -> Result<Vec<String>> {
        Ok(self
            .call("listplaylists", |c| c.playlists())?
            .into_iter()
            .map(|playlist| playlist.name)
            .collect())
    }

    fn playlist_songs(&mut self, name: &str) -> Result<Vec<String>> {
        let name = name.to_string();
        Ok(self
            .call("listplaylist", |c| c.playlist(&name))?
            .into_iter()
            .map(|song| song.file)
            .collect())
    }

    fn playlist_add(&mut self, name: &str, uri: &str) -> Result<()> {
        let name = name.to_string();
        self.call("playlistadd", |c| c.pl_push(&name, song_path(uri)))
    }

    fn playlist_remove(&mut self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.call("rm", |c| c.pl_remove(&name))
    }

    fn search_to_playlist(&mut self, query: &SearchQuery, name: &str) -> Result<()> {
        match query {
            SearchQuery::Expression(expr) => self.run_ok("searchaddpl", &[name, expr]),
            SearchQuery::Tag { tag, value } => self.run_ok("searchaddpl", &[name, tag, value]),
        }
    }

    fn sticker_get(&mut self, uri: &str, name: &str) -> Result<Option<String>> {
        match self.call("sticker get", |c| c.sticker("song", uri, name)) {
            Ok(value) => {
                let prefix = format!("{name}=");
                Ok(Some(value.strip_prefix(&prefix).unwrap_or(&value).to_string()))
            }
            Err(EngineError::Protocol { message, .. }) if message.contains("no such sticker") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn sticker_list(&mut self, uri: &str) -> Result<Vec<(String, String)>> {
        Ok(values_of(self.run("sticker list", &["song", uri])?, "sticker")
            .into_iter()
            .filter_map(|s| {
                s.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect())
    }

    fn sticker_set(&mut self, uri: &str, name: &str, value: &str) -> Result<()> {
        self.call("sticker set", |c| c.set_sticker("song", uri, name, value))
    }

    fn sticker_find(&mut self, name: &str) -> Result<Vec<(String, String)>> {
        let mut found = Vec::new();
        let mut file: Option<String> = None;
        for (key, value) in self.run("sticker find", &["song", "", name])? {
            match key.as_str() {
                "file" => file = Some(value),
                "sticker" => {
                    if let (Some(uri), Some((_, v))) = (file.take(), value.split_once('=')) {
                        found.push((uri, v.to_string()));
                    }
                }
                _ => {}
            }
        }
        Ok(found)
    }

    fn enter_idle(&mut self) -> Result<()> {
        if !self.idle {
            self.send(IDLE_COMMAND, &[])?;
            self.idle = true;
        }
        Ok(())
    }

    fn poll_idle(&mut self, timeout: Duration) -> Result<bool> {
        if !self.idle {
            return Ok(false);
        }
        if !self.raw.buffer().is_empty() {
            return Ok(true);
        }
        let wait = timeout.max(Duration::from_millis(1));
        if let Err(e) = self.raw.get_ref().set_read_timeout(wait) {
            return Err(self.io_error(e));
        }
        let ready = match self.raw.fill_buf() {
            Ok([]) => {
                self.broken = true;
                return Err(EngineError::Connection("connection closed by MPD".to_string()));
            }
            Ok(_) => true,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                false
            }
            Err(e) => return Err(self.io_error(e)),
        };
        if let Err(e) = self.raw.get_ref().set_read_timeout(self.timeout) {
            return Err(self.io_error(e));
        }
        Ok(ready)
    }

    fn leave_idle(&mut self) -> Result<Vec<Subsystem>> {
        if !self.idle {
            return Ok(Vec::new());
        }
        // Ignored by MPD if the idle response is already on its way
        self.send("noidle", &[])?;
        self.idle = false;
        let mut changed = Vec::new();
        self.read_response("idle", |key, value| {
            if key == "changed" {
                match Subsystem::parse(&value) {
                    Some(subsystem) => changed.push(subsystem),
                    None => trace!("Ignoring idle event {value}"),
                }
            }
        })?;
        Ok(changed)
    }
}

/// Opens [`MpdConnection`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct MpdConnector;

impl Connector for MpdConnector {
    fn connect(&mut self, settings: &ConnectionSettings) -> Result<Box<dyn Daemon>> {
        Ok(Box::new(MpdConnection::open(settings)?))
    }
}
