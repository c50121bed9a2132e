//! # Integration Tests for Tonearm
//!
//! End-to-end tests through the public API: the supervisor driving an in-memory
//! daemon, the engine threads, the last played log on disk and the binary's
//! command-line surface.

use std::fs;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tempfile::TempDir;

use tonearm::api::{CommandId, Request, Response};
use tonearm::config::{EngineConfig, StateStore, Workdir};
use tonearm::daemon::memory::{MemoryConnector, MemoryDaemon};
use tonearm::daemon::{Daemon, PlayState};
use tonearm::job_queue::JobQueue;
use tonearm::jukebox::JukeboxMode;
use tonearm::session::Session;
use tonearm::supervisor::{ConnectionState, ConnectionSupervisor};

/// Supervisor over an in-memory daemon, with its queues exposed
struct Harness {
    _dir: TempDir,
    supervisor: ConnectionSupervisor,
    daemon: MemoryDaemon,
    inbound: Arc<JobQueue<Request>>,
    outbound: Arc<JobQueue<Response>>,
}

fn create_test_harness(config: EngineConfig, songs: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let workdir = Workdir::prepare(dir.path()).unwrap();
    let inbound = Arc::new(JobQueue::new("inbound"));
    let outbound = Arc::new(JobQueue::new("outbound"));
    let session = Session::new(
        config,
        StateStore::new(workdir.state_dir()),
        &workdir,
        Arc::clone(&outbound),
        Arc::new(JobQueue::new("internal")),
    )
    .with_seed(11);
    let daemon = MemoryDaemon::with_library(songs);
    let supervisor = ConnectionSupervisor::new(
        Box::new(MemoryConnector::new(daemon.clone())),
        session,
        Arc::clone(&inbound),
    );
    Harness {
        _dir: dir,
        supervisor,
        daemon,
        inbound,
        outbound,
    }
}

fn bodies(outbound: &JobQueue<Response>) -> Vec<Value> {
    outbound.drain().iter().map(|r| r.json().unwrap()).collect()
}

fn reply(bodies: &[Value], id: u64) -> Value {
    bodies
        .iter()
        .find(|b| b["id"] == id)
        .cloned()
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod jukebox_tests {
    use super::*;

    #[test]
    fn test_connect_fills_empty_queue_and_plays() {
        let mut config = EngineConfig::default();
        config.jukebox.mode = JukeboxMode::AddSong;
        config.jukebox.queue_length = 5;
        let mut h = create_test_harness(config, 10);

        h.supervisor.tick(1_000);
        assert_eq!(h.supervisor.state(), ConnectionState::Connected);

        let mut queue = h.daemon.queue_uris();
        assert_eq!(queue.len(), 5);
        queue.sort();
        queue.dedup();
        assert_eq!(queue.len(), 5);
        assert_eq!(h.daemon.lock().state, PlayState::Play);
    }

    #[test]
    fn test_jukebox_fill_command_tops_up_queue() {
        let mut config = EngineConfig::default();
        config.jukebox.mode = JukeboxMode::AddSong;
        config.jukebox.queue_length = 3;
        let mut h = create_test_harness(config, 10);
        h.supervisor.tick(1_000);
        h.daemon.update(|s| {
            s.queue.truncate(1);
            s.queue_version += 1;
        });

        h.inbound
            .push(Request::new(2, 1, CommandId::JukeboxFill, Value::Null));
        h.supervisor.tick(1_001);
        h.supervisor.tick(1_002);
        assert_eq!(h.daemon.queue_uris().len(), 3);
    }

    #[test]
    fn test_album_mode_adds_whole_albums() {
        let mut config = EngineConfig::default();
        config.jukebox.mode = JukeboxMode::AddAlbum;
        config.jukebox.queue_length = 2;
        let mut h = create_test_harness(config, 6);
        h.supervisor.tick(1_000);

        let queue = h.daemon.queue_uris();
        assert_eq!(queue.len(), 2);
        assert_ne!(queue[0], queue[1]);
    }
}

#[cfg(test)]
mod playback_tests {
    use super::*;
    use tonearm::stickers::{PLAY_COUNT, SKIP_COUNT};

    fn staged_daemon() -> MemoryDaemon {
        let mut daemon = MemoryDaemon::with_library(3);
        daemon.update(|s| {
            for song in s.library.iter_mut() {
                song.duration = 30;
            }
        });
        daemon.add("Artist 1/Album 1/Track 1.flac").unwrap();
        daemon.add("Artist 2/Album 2/Track 2.flac").unwrap();
        daemon
    }

    fn connected_session(daemon: &mut MemoryDaemon) -> (TempDir, Session) {
        let dir = TempDir::new().unwrap();
        let workdir = Workdir::prepare(dir.path()).unwrap();
        let mut session = Session::new(
            EngineConfig::default(),
            StateStore::new(workdir.state_dir()),
            &workdir,
            Arc::new(JobQueue::new("outbound")),
            Arc::new(JobQueue::new("internal")),
        );
        session.on_connected(daemon, 0).unwrap();
        (dir, session)
    }

    #[test]
    fn test_song_changed_after_twelve_seconds_is_a_skip() {
        let mut daemon = staged_daemon();
        let (_dir, mut session) = connected_session(&mut daemon);
        daemon.play().unwrap();
        session.refresh_status(&mut daemon, 100).unwrap();

        daemon.next().unwrap();
        session.refresh_status(&mut daemon, 112).unwrap();
        session.mark_played(&mut daemon, 112).unwrap();

        let first = "Artist 1/Album 1/Track 1.flac";
        assert_eq!(daemon.sticker(first, SKIP_COUNT).as_deref(), Some("1"));
        assert_eq!(daemon.sticker(first, PLAY_COUNT), None);
    }

    #[test]
    fn test_song_changed_after_five_seconds_is_neither() {
        let mut daemon = staged_daemon();
        let (_dir, mut session) = connected_session(&mut daemon);
        daemon.play().unwrap();
        session.refresh_status(&mut daemon, 100).unwrap();

        daemon.next().unwrap();
        session.refresh_status(&mut daemon, 105).unwrap();

        let first = "Artist 1/Album 1/Track 1.flac";
        assert_eq!(daemon.sticker(first, SKIP_COUNT), None);
        assert_eq!(daemon.sticker(first, PLAY_COUNT), None);
    }

    #[test]
    fn test_song_past_threshold_is_played() {
        let mut daemon = staged_daemon();
        let (_dir, mut session) = connected_session(&mut daemon);
        daemon.play().unwrap();
        session.refresh_status(&mut daemon, 100).unwrap();

        session.mark_played(&mut daemon, 125).unwrap();
        daemon.next().unwrap();
        session.refresh_status(&mut daemon, 125).unwrap();

        let first = "Artist 1/Album 1/Track 1.flac";
        assert_eq!(daemon.sticker(first, PLAY_COUNT).as_deref(), Some("1"));
        assert_eq!(daemon.sticker(first, SKIP_COUNT), None);
        let (entries, total) = session.last_played.read(0, 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries[0].uri, first);
    }
}

#[cfg(test)]
mod last_played_tests {
    use super::*;
    use tonearm::last_played::LastPlayedList;

    #[test]
    fn test_twelve_inserts_merge_memory_then_disk() {
        let dir = TempDir::new().unwrap();
        let mut list = LastPlayedList::new(dir.path().join("last_played"), 10);
        for i in 1..=11 {
            list.add(&format!("song{i}.flac"), i).unwrap();
        }
        assert_eq!(list.pending(), 1);
        assert_eq!(
            fs::read_to_string(list.path()).unwrap().lines().count(),
            10
        );

        list.add("song12.flac", 12).unwrap();
        let (page, total) = list.read(0, 10).unwrap();
        assert_eq!(total, 12);
        let timestamps: Vec<i64> = page.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, (3..=12).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_list_command_pages_through_log() {
        let mut h = create_test_harness(EngineConfig::default(), 2);
        for i in 1..=4 {
            h.supervisor
                .session_mut()
                .last_played
                .add(&format!("song{i}.flac"), i)
                .unwrap();
        }
        h.inbound.push(Request::new(
            5,
            1,
            CommandId::LastPlayedList,
            json!({"offset": 1, "limit": 2}),
        ));
        h.supervisor.tick(1_000);
        h.supervisor.tick(1_000);

        let page = reply(&bodies(&h.outbound), 1);
        assert_eq!(page["result"]["totalEntities"], 4);
        assert_eq!(page["result"]["returnedEntities"], 2);
        assert_eq!(page["result"]["data"][0]["uri"], "song3.flac");
    }
}

#[cfg(test)]
mod supervisor_tests {
    use super::*;

    #[test]
    fn test_waiting_supervisor_answers_every_job() {
        let mut h = create_test_harness(EngineConfig::default(), 2);
        h.daemon.update(|s| s.refuse_connections = true);
        h.supervisor.tick(1_000);
        h.supervisor.tick(1_000);
        assert_eq!(h.supervisor.state(), ConnectionState::Waiting);
        h.outbound.drain();

        for id in 1..=3 {
            h.inbound
                .push(Request::new(7, id, CommandId::PlayerPlay, Value::Null));
        }
        let start = Instant::now();
        for _ in 0..3 {
            h.supervisor.tick(1_000);
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        let replies = bodies(&h.outbound);
        assert_eq!(replies.len(), 3);
        for (i, body) in replies.iter().enumerate() {
            assert_eq!(body["id"], i as u64 + 1);
            assert_eq!(body["error"]["message"], "MPD disconnected");
        }
        assert!(h.inbound.is_empty());
    }

    #[test]
    fn test_lost_daemon_reconnects_after_backoff() {
        let mut h = create_test_harness(EngineConfig::default(), 2);
        h.supervisor.tick(1_000);
        h.outbound.drain();

        h.daemon.update(|s| s.online = false);
        h.supervisor.tick(1_001);
        h.supervisor.tick(1_001);
        assert_eq!(h.supervisor.state(), ConnectionState::Waiting);
        assert!(bodies(&h.outbound)
            .iter()
            .any(|b| b["method"] == "mpd_disconnected"));

        h.daemon.update(|s| s.online = true);
        h.supervisor.tick(1_003);
        h.supervisor.tick(1_003);
        assert_eq!(h.supervisor.state(), ConnectionState::Connected);
        assert!(bodies(&h.outbound)
            .iter()
            .any(|b| b["method"] == "mpd_connected"));
    }

    #[test]
    fn test_idle_event_from_other_client_is_broadcast() {
        let mut h = create_test_harness(EngineConfig::default(), 2);
        h.supervisor.tick(1_000);
        h.outbound.drain();

        h.daemon.update(|s| s.volume = 40);
        h.daemon.notify(tonearm::daemon::Subsystem::Mixer);
        h.supervisor.tick(1_001);

        let events = bodies(&h.outbound);
        let volume = events
            .iter()
            .find(|b| b["method"] == "update_volume")
            .unwrap();
        assert_eq!(volume["params"]["volume"], 40);
    }

    #[test]
    fn test_smart_playlist_saved_and_refreshed() {
        let mut h = create_test_harness(EngineConfig::default(), 3);
        h.supervisor.tick(1_000);
        h.inbound.push(Request::new(
            1,
            1,
            CommandId::SmartplsSave,
            json!({
                "playlist": "Artist 3 only",
                "definition": {"type": "search", "tag": "Artist", "searchstr": "Artist 3"}
            }),
        ));
        h.supervisor.tick(1_001);

        let mut daemon = h.daemon.clone();
        assert_eq!(
            daemon.playlist_songs("Artist 3 only").unwrap(),
            vec!["Artist 3/Album 3/Track 3.flac"]
        );
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use tonearm::engine::Engine;
    use tonearm::settings::MUSIC_DIRECTORY_VALUE;

    fn wait_for(outbound: &JobQueue<Response>, connection_id: i64) -> Option<Value> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(response) = outbound.shift(Duration::from_millis(50)) {
                if response.connection_id == connection_id {
                    return response.json().ok();
                }
            }
        }
        None
    }

    #[test]
    fn test_settings_set_is_persisted_and_bootstrap_stored() {
        let dir = TempDir::new().unwrap();
        let workdir = Workdir::prepare(dir.path()).unwrap();
        let store = StateStore::new(workdir.state_dir());
        let daemon = MemoryDaemon::with_library(2);
        daemon.update(|s| s.music_directory = Some(dir.path().display().to_string()));
        let mut config = EngineConfig::default();
        config.connection.host = "/run/mpd/socket".to_string();

        let engine = Engine::start(
            config,
            store.clone(),
            &workdir,
            Box::new(MemoryConnector::new(daemon)),
        )
        .unwrap();
        engine.inbound().push(Request::new(
            3,
            1,
            CommandId::SettingsSet,
            json!({"last_played_count": 50}),
        ));
        let answer = wait_for(&engine.outbound(), 3).unwrap();
        assert_eq!(answer["result"]["message"], "ok");

        let bootstrap = workdir.state_dir().join(MUSIC_DIRECTORY_VALUE);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !bootstrap.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        engine.stop().unwrap();

        assert_eq!(store.read_number("last_played_count", 0usize).unwrap(), 50);
        assert_eq!(
            fs::read_to_string(bootstrap).unwrap().trim(),
            dir.path().display().to_string()
        );
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    fn tonearm() -> Command {
        Command::new(env!("CARGO_BIN_EXE_tonearm"))
    }

    #[test]
    fn test_cli_help_displays_correctly() {
        let output = tonearm()
            .arg("--help")
            .output()
            .expect("Failed to run help command");

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("tonearm"));
        assert!(stdout.contains("run"));
        assert!(stdout.contains("last-played"));
        assert!(stdout.contains("completion"));
    }

    #[test]
    fn test_completion_generation() {
        let output = tonearm()
            .args(["completion", "bash"])
            .output()
            .expect("Failed to run completion command");

        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("_tonearm"));
        assert!(stdout.contains("complete"));
    }

    #[test]
    fn test_last_played_reads_workdir() {
        let dir = TempDir::new().unwrap();
        let workdir = Workdir::prepare(dir.path()).unwrap();
        fs::write(
            workdir.last_played_file(),
            "20::b.flac\n10::a.flac\n",
        )
        .unwrap();

        let output = tonearm()
            .arg("--workdir")
            .arg(dir.path())
            .args(["last-played", "--limit", "1"])
            .output()
            .expect("Failed to run last-played command");

        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert_eq!(stdout.trim(), "20\tb.flac");
    }
}
