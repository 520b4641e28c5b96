//! # comprehensive storage tests
//!
//! why: verify all durable log scenarios work correctly
//! relations: tests raft-storage crate against raft-core's RaftLog contract
//! what: persistence, crash recovery, atomic writes, corruption, consensus restarts

use std::fs;
use std::io;
use std::sync::Arc;

use raft_core::{
    AppendEntriesRequest, ConsensusManager, HardState, LocalNetwork, LogEntry, MemoryLog, NodeState,
    Proposal, RaftConfig, RaftLog, RaftNode, VoteRequest,
};
use raft_storage::FileLog;
use serde_json::json;
use tempfile::tempdir;

fn hard_state(term: u64, voted_for: Option<&str>) -> HardState {
    HardState {
        current_term: term,
        voted_for: voted_for.map(str::to_string),
    }
}

// =============================================================================
// SECTION 1: FILE LOG BASICS
// =============================================================================

mod file_log_basic {
    use super::*;

    #[test]
    fn open_creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raft_data");

        let log = FileLog::open(&path).unwrap();

        assert!(path.exists());
        assert_eq!(log.path(), path.as_path());
    }

    #[test]
    fn new_log_has_default_values() {
        let dir = tempdir().unwrap();
        let log = FileLog::open(dir.path()).unwrap();

        assert_eq!(log.hard_state().unwrap(), HardState::default());
        assert_eq!(log.last_index(), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn save_and_load_hard_state() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();

        log.save_hard_state(&hard_state(7, Some("node-3"))).unwrap();

        assert_eq!(log.hard_state().unwrap(), hard_state(7, Some("node-3")));
    }

    #[test]
    fn save_voted_for_none() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();

        log.save_hard_state(&hard_state(10, None)).unwrap();

        assert_eq!(log.hard_state().unwrap(), hard_state(10, None));
    }

    #[test]
    fn save_creates_meta_file() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();

        log.save_hard_state(&hard_state(5, Some("node-2"))).unwrap();

        assert!(dir.path().join("meta.json").exists());
    }
}

// =============================================================================
// SECTION 2: LOG ENTRIES
// =============================================================================

mod file_log_entries {
    use super::*;

    #[test]
    fn append_creates_log_file() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();

        log.append(LogEntry::new(1, 1, b"cmd".to_vec())).unwrap();

        assert!(dir.path().join("log.jsonl").exists());
    }

    #[test]
    fn append_and_read_entries() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();

        log.append(LogEntry::new(1, 1, b"SET key1 value1".to_vec())).unwrap();
        log.append(LogEntry::new(2, 2, b"SET key2 value2".to_vec())).unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log.entry(1).unwrap().command, b"SET key1 value1".to_vec());
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.term_at(1), 1);
        assert_eq!(log.term_at(3), 0);
    }

    #[test]
    fn entries_from_returns_suffix() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();
        for i in 1..=4 {
            log.append(LogEntry::new(1, i, vec![i as u8])).unwrap();
        }

        let suffix = log.entries_from(3);

        assert_eq!(suffix.iter().map(|e| e.index).collect::<Vec<_>>(), vec![3, 4]);
        assert!(log.entries_from(5).is_empty());
    }

    #[test]
    fn truncate_drops_suffix() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();
        for term in 1..=3 {
            log.append(LogEntry::new(term, term, vec![term as u8])).unwrap();
        }

        log.truncate_after(1).unwrap();

        assert_eq!(log.last_index(), 1);
        assert!(log.entry(2).is_none());
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY / PERSISTENCE TESTS
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn term_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            log.save_hard_state(&hard_state(10, Some("node-5"))).unwrap();
        }

        // "restart" - new log instance
        let log = FileLog::open(dir.path()).unwrap();
        assert_eq!(log.hard_state().unwrap(), hard_state(10, Some("node-5")));
    }

    #[test]
    fn log_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            log.append(LogEntry::new(1, 1, b"cmd1".to_vec())).unwrap();
            log.append(LogEntry::new(1, 2, b"cmd2".to_vec())).unwrap();
        }

        let log = FileLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.entry(2).unwrap().command, b"cmd2".to_vec());
    }

    #[test]
    fn multiple_restarts_preserve_state() {
        let dir = tempdir().unwrap();
        for session in 1..=3u64 {
            let mut log = FileLog::open(dir.path()).unwrap();
            assert_eq!(log.last_index(), session - 1);
            log.append(LogEntry::new(session, session, vec![])).unwrap();
            log.save_hard_state(&hard_state(session, None)).unwrap();
        }

        let log = FileLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 3);
        assert_eq!(log.hard_state().unwrap().current_term, 3);
    }

    #[test]
    fn truncation_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            for _ in 0..3 {
                log.append(LogEntry::new(1, 0, b"old".to_vec())).unwrap();
            }
            log.truncate_after(1).unwrap();
            log.append(LogEntry::new(2, 0, b"new".to_vec())).unwrap();
        }

        let log = FileLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.entry(1).unwrap().command, b"old".to_vec());
        assert_eq!(log.entry(2).unwrap().command, b"new".to_vec());
        assert_eq!(log.term_at(2), 2);
    }

    #[test]
    fn torn_append_is_discarded_on_restart() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            log.append(LogEntry::new(1, 1, b"cmd1".to_vec())).unwrap();
            log.append(LogEntry::new(1, 2, b"cmd2".to_vec())).unwrap();
        }

        // crash part way through writing entry 3
        let log_path = dir.path().join("log.jsonl");
        let mut contents = fs::read(&log_path).unwrap();
        let intact_len = contents.len() as u64;
        contents.extend_from_slice(br#"{"term":1,"index":3,"comm"#);
        fs::write(&log_path, &contents).unwrap();

        let mut log = FileLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(fs::metadata(&log_path).unwrap().len(), intact_len);

        // the next append lands on a clean line and survives another restart
        assert_eq!(log.append(LogEntry::new(2, 0, b"cmd3".to_vec())).unwrap(), 3);
        drop(log);

        let log = FileLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.entry(3).unwrap().command, b"cmd3".to_vec());
        assert_eq!(log.term_at(3), 2);
    }

    #[test]
    fn unterminated_complete_line_is_discarded() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            log.append(LogEntry::new(1, 1, b"cmd1".to_vec())).unwrap();
        }

        // the line was written but the newline never made it, so it was never acknowledged
        let log_path = dir.path().join("log.jsonl");
        let mut contents = fs::read(&log_path).unwrap();
        serde_json::to_writer(&mut contents, &LogEntry::new(1, 2, b"cmd2".to_vec())).unwrap();
        fs::write(&log_path, &contents).unwrap();

        let log = FileLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 1);
    }
}

// =============================================================================
// SECTION 4: ATOMIC WRITE TESTS
// =============================================================================

mod atomic_writes {
    use super::*;

    #[test]
    fn meta_file_is_valid_json() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();

        log.save_hard_state(&hard_state(5, Some("node-2"))).unwrap();

        let contents = fs::read_to_string(dir.path().join("meta.json")).unwrap();
        let _: serde_json::Value = serde_json::from_str(&contents).expect("valid JSON");
    }

    #[test]
    fn every_log_line_is_valid_json() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();

        log.append(LogEntry::new(1, 1, b"a".to_vec())).unwrap();
        log.append(LogEntry::new(1, 2, b"b".to_vec())).unwrap();

        let contents = fs::read_to_string(dir.path().join("log.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let _: serde_json::Value = serde_json::from_str(line).expect("valid JSON");
        }
    }

    #[test]
    fn no_temp_files_remain() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();

        log.save_hard_state(&hard_state(5, Some("node-2"))).unwrap();
        log.append(LogEntry::new(1, 1, b"cmd".to_vec())).unwrap();
        log.append(LogEntry::new(1, 2, b"cmd".to_vec())).unwrap();
        log.truncate_after(1).unwrap();

        // temp files should be renamed away
        assert!(!dir.path().join("meta.json.tmp").exists());
        assert!(!dir.path().join("log.jsonl.tmp").exists());
    }
}

// =============================================================================
// SECTION 5: CORRUPTION
// =============================================================================

mod corruption {
    use super::*;

    fn open_error(dir: &std::path::Path) -> io::Error {
        match FileLog::open(dir) {
            Ok(_) => panic!("corrupt log opened"),
            Err(e) => e,
        }
    }

    #[test]
    fn garbage_line_is_invalid_data() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            log.append(LogEntry::new(1, 1, b"ok".to_vec())).unwrap();
        }
        let path = dir.path().join("log.jsonl");
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("{not json\n");
        fs::write(&path, contents).unwrap();

        assert_eq!(open_error(dir.path()).kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn index_gap_is_invalid_data() {
        let dir = tempdir().unwrap();
        let line = serde_json::to_string(&LogEntry::new(1, 2, vec![])).unwrap();
        fs::write(dir.path().join("log.jsonl"), format!("{line}\n")).unwrap();

        assert_eq!(open_error(dir.path()).kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn corrupt_meta_is_invalid_data() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("meta.json"), "term=5").unwrap();

        assert_eq!(open_error(dir.path()).kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn blank_lines_are_tolerated() {
        let dir = tempdir().unwrap();
        let line = serde_json::to_string(&LogEntry::new(1, 1, vec![])).unwrap();
        fs::write(dir.path().join("log.jsonl"), format!("\n{line}\n\n")).unwrap();

        let log = FileLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 1);
    }
}

// =============================================================================
// SECTION 6: EDGE CASES
// =============================================================================

mod edge_cases {
    use super::*;

    #[test]
    fn large_log_entry() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();

        // 1MB command
        log.append(LogEntry::new(1, 1, vec![0u8; 1024 * 1024])).unwrap();

        let reopened = FileLog::open(dir.path()).unwrap();
        assert_eq!(reopened.entry(1).unwrap().command.len(), 1024 * 1024);
    }

    #[test]
    fn many_log_entries() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();

        for i in 1..=500u64 {
            log.append(LogEntry::new(1, i, format!("cmd{i}").into_bytes())).unwrap();
        }

        let reopened = FileLog::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 500);
        assert_eq!(reopened.entry(500).unwrap().command, b"cmd500".to_vec());
    }

    #[test]
    fn binary_and_unicode_commands() {
        let dir = tempdir().unwrap();
        let binary = vec![0x00, 0xFF, 0x7F, 0x80, 0xFE];
        let unicode = "SET 键 值 🎉".as_bytes().to_vec();
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            log.append(LogEntry::new(1, 1, binary.clone())).unwrap();
            log.append(LogEntry::new(1, 2, unicode.clone())).unwrap();
        }

        let log = FileLog::open(dir.path()).unwrap();
        assert_eq!(log.entry(1).unwrap().command, binary);
        assert_eq!(log.entry(2).unwrap().command, unicode);
    }

    #[test]
    fn very_high_term_number() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            log.save_hard_state(&hard_state(u64::MAX, Some("node-1"))).unwrap();
        }

        let log = FileLog::open(dir.path()).unwrap();
        assert_eq!(log.hard_state().unwrap().current_term, u64::MAX);
    }

    #[test]
    fn truncate_past_the_end_is_a_noop() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();
        log.append(LogEntry::new(1, 1, vec![])).unwrap();

        log.truncate_after(10).unwrap();

        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn truncate_everything() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            log.append(LogEntry::new(1, 1, vec![])).unwrap();
            log.append(LogEntry::new(1, 2, vec![])).unwrap();
            log.truncate_after(0).unwrap();
            assert!(log.is_empty());
        }

        let log = FileLog::open(dir.path()).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.last_term(), 0);
    }
}

// =============================================================================
// SECTION 7: RAFT LOG TRAIT POLYMORPHISM
// =============================================================================

mod trait_polymorphism {
    use super::*;

    fn exercise_log(log: &mut dyn RaftLog) {
        // save and load hard state
        log.save_hard_state(&hard_state(5, Some("node-2"))).unwrap();
        assert_eq!(log.hard_state().unwrap(), hard_state(5, Some("node-2")));

        // append and read
        assert_eq!(log.append(LogEntry::new(1, 1, b"cmd".to_vec())).unwrap(), 1);
        assert_eq!(log.append(LogEntry::new(5, 2, b"cmd".to_vec())).unwrap(), 2);
        assert_eq!(log.last_term(), 5);

        // truncate
        log.truncate_after(0).unwrap();
        assert_eq!(log.last_index(), 0);
        assert!(log.entries_from(1).is_empty());
    }

    #[test]
    fn memory_log_implements_trait() {
        exercise_log(&mut MemoryLog::new());
    }

    #[test]
    fn file_log_implements_trait() {
        let dir = tempdir().unwrap();
        exercise_log(&mut FileLog::open(dir.path()).unwrap());
    }
}

// =============================================================================
// SECTION 8: CONSENSUS RESTARTS
// =============================================================================

mod consensus_restarts {
    use super::*;

    fn cluster() -> Vec<String> {
        vec!["node-1".into(), "node-2".into(), "node-3".into()]
    }

    #[test]
    fn node_restores_vote_from_disk() {
        let dir = tempdir().unwrap();
        {
            let log = FileLog::open(dir.path()).unwrap();
            let mut node = RaftNode::new("node-1", cluster(), Box::new(log)).unwrap();
            let (response, _) = node
                .handle_vote_request(&VoteRequest {
                    term: 4,
                    candidate_id: "node-2".into(),
                    last_log_index: 0,
                    last_log_term: 0,
                })
                .unwrap();
            assert!(response.vote_granted);
        }

        let log = FileLog::open(dir.path()).unwrap();
        let mut node = RaftNode::new("node-1", cluster(), Box::new(log)).unwrap();
        assert_eq!(node.current_term, 4);
        assert_eq!(node.voted_for.as_deref(), Some("node-2"));

        // the restarted node must not vote twice in term 4
        let (response, _) = node
            .handle_vote_request(&VoteRequest {
                term: 4,
                candidate_id: "node-3".into(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(!response.vote_granted);
    }

    #[test]
    fn conflict_truncation_reaches_disk() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            log.append(LogEntry::new(1, 1, b"keep".to_vec())).unwrap();
            log.append(LogEntry::new(1, 2, b"stale".to_vec())).unwrap();
            let mut node = RaftNode::new("node-1", cluster(), Box::new(log)).unwrap();

            let (response, _) = node
                .handle_append_entries(&AppendEntriesRequest {
                    term: 2,
                    leader_id: "node-2".into(),
                    prev_log_index: 1,
                    prev_log_term: 1,
                    entries: vec![LogEntry::new(2, 2, b"fresh".to_vec())],
                    leader_commit: 0,
                })
                .unwrap();
            assert!(response.success);
        }

        let log = FileLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.entry(2).unwrap().command, b"fresh".to_vec());
        assert_eq!(log.hard_state().unwrap().current_term, 2);
    }

    #[tokio::test]
    async fn manager_restart_keeps_term_and_log() {
        let dir = tempdir().unwrap();
        {
            let manager = ConsensusManager::with_tokio_timers(
                RaftConfig::default(),
                Box::new(FileLog::open(dir.path()).unwrap()),
                Arc::new(LocalNetwork::new()),
            )
            .unwrap();
            manager.initialize("solo", vec![]).await.unwrap();
            manager.trigger_election().await.unwrap();
            assert!(manager.is_leader("solo").await.unwrap());

            let proposal = Proposal::new("assign", json!({ "task": 1 }), "solo");
            assert!(manager.propose(&proposal).await.unwrap());
            manager.shutdown().await;
        }

        let manager = ConsensusManager::with_tokio_timers(
            RaftConfig::default(),
            Box::new(FileLog::open(dir.path()).unwrap()),
            Arc::new(LocalNetwork::new()),
        )
        .unwrap();
        manager.initialize("solo", vec![]).await.unwrap();

        let state = manager.get_state().await.unwrap();
        assert_eq!(state.role, NodeState::Follower);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for.as_deref(), Some("solo"));
        assert_eq!(manager.last_log_index().await.unwrap(), 1);
        manager.shutdown().await;
    }
}
