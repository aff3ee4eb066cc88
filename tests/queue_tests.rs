//! End-to-end queue behavior over real directories.

use mmapq::{MmapQueue, QueueConfig, QueueError, QueueOptions};
use tempfile::TempDir;

fn open_queue(dir: &std::path::Path, arena_size: u64) -> MmapQueue {
    QueueOptions::new()
        .arena_size(arena_size)
        .expect("arena size")
        .open(dir)
        .expect("open queue")
}

#[test]
fn single_record_round_trip() {
    let tmp = TempDir::new().expect("tempdir");
    let queue = open_queue(tmp.path(), 4096);

    queue.enqueue(b"abcdefghij").expect("enqueue");
    assert!(!queue.is_empty());
    assert_eq!(queue.dequeue().expect("dequeue"), b"abcdefghij");
    assert!(queue.is_empty());
}

#[test]
fn fifo_order_is_preserved() {
    let tmp = TempDir::new().expect("tempdir");
    let queue = open_queue(tmp.path(), 4096);

    let messages: Vec<Vec<u8>> = (0u8..50).map(|i| vec![i; (i as usize % 37) + 1]).collect();
    for message in &messages {
        queue.enqueue(message).expect("enqueue");
    }
    for message in &messages {
        assert_eq!(&queue.dequeue().expect("dequeue"), message);
    }
    assert!(queue.is_empty());
}

#[test]
fn empty_payload_is_a_record() {
    let tmp = TempDir::new().expect("tempdir");
    let queue = open_queue(tmp.path(), 4096);

    queue.enqueue(b"").expect("enqueue");
    assert!(!queue.is_empty());
    assert_eq!(queue.dequeue().expect("dequeue"), Vec::<u8>::new());
    assert!(queue.is_empty());
}

#[test]
fn payloads_crossing_arena_boundaries_round_trip() {
    let tmp = TempDir::new().expect("tempdir");
    let queue = open_queue(tmp.path(), 4096);

    // the first record fills arena 0 except the last 8 bytes; the second
    // spans four arenas
    let first = vec![b'a'; 4080];
    let second = vec![b'a'; 12276];
    queue.enqueue(&first).expect("enqueue first");
    queue.enqueue(&second).expect("enqueue second");

    assert_eq!(queue.dequeue().expect("dequeue first"), first);
    assert_eq!(queue.dequeue().expect("dequeue second"), second);
    assert!(queue.is_empty());
}

#[test]
fn restart_recovers_pending_records() {
    let tmp = TempDir::new().expect("tempdir");

    let first = vec![b'a'; 4088];
    let second = vec![b'b'; 8180];
    {
        let queue = open_queue(tmp.path(), 8192);
        queue.enqueue(&first).expect("enqueue first");
        queue.enqueue(&second).expect("enqueue second");
        queue.close().expect("close");
    }

    let queue = open_queue(tmp.path(), 8192);
    assert_eq!(queue.dequeue().expect("dequeue first"), first);
    assert_eq!(queue.dequeue().expect("dequeue second"), second);
    assert!(queue.is_empty());
}

#[test]
fn flush_then_reopen_preserves_order() {
    let tmp = TempDir::new().expect("tempdir");
    let messages: Vec<Vec<u8>> = (0u8..10).map(|i| vec![i; 100]).collect();

    {
        let queue = open_queue(tmp.path(), 4096);
        for message in &messages {
            queue.enqueue(message).expect("enqueue");
        }
        queue.flush().expect("flush");
        queue.close().expect("close");
    }

    let queue = open_queue(tmp.path(), 4096);
    for message in &messages {
        assert_eq!(&queue.dequeue().expect("dequeue"), message);
    }
}

#[test]
fn reopen_with_mismatched_arena_size_fails() {
    let tmp = TempDir::new().expect("tempdir");
    {
        let queue = open_queue(tmp.path(), 4096);
        queue.enqueue(b"seed").expect("enqueue");
        queue.close().expect("close");
    }

    let err = QueueOptions::new()
        .arena_size(8192)
        .expect("arena size")
        .open(tmp.path())
        .unwrap_err();
    assert!(matches!(
        err,
        QueueError::MismatchedArenaSize {
            persisted: 4096,
            configured: 8192
        }
    ));

    // the original size still opens and recovers the record
    let queue = open_queue(tmp.path(), 4096);
    assert_eq!(queue.dequeue().expect("dequeue"), b"seed");
}

#[test]
fn non_page_multiple_arena_size_reopens() {
    let tmp = TempDir::new().expect("tempdir");
    {
        let queue = open_queue(tmp.path(), 5000);
        queue.enqueue(b"odd sized arena").expect("enqueue");
        queue.close().expect("close");
    }
    let queue = open_queue(tmp.path(), 5000);
    assert_eq!(queue.dequeue().expect("dequeue"), b"odd sized arena");
}

#[test]
fn named_consumers_track_independent_heads() {
    let tmp = TempDir::new().expect("tempdir");

    let first = b"first".to_vec();
    let second = b"second".to_vec();
    {
        let queue = open_queue(tmp.path(), 4096);
        let lagging = queue.consumer("lagging").expect("consumer");

        queue.enqueue(&first).expect("enqueue");
        queue.enqueue(&second).expect("enqueue");
        assert_eq!(queue.dequeue().expect("default dequeue"), first);

        // the default consumer moved; the named one did not
        assert_eq!(lagging.peek().expect("peek"), first);
        assert!(!lagging.is_empty());
        queue.close().expect("close");
    }

    let queue = open_queue(tmp.path(), 4096);
    let lagging = queue.consumer("lagging").expect("consumer");
    assert_eq!(lagging.dequeue().expect("dequeue"), first);
    assert_eq!(lagging.dequeue().expect("dequeue"), second);
    assert!(lagging.is_empty());

    // and the default consumer still has one record left
    assert_eq!(queue.dequeue().expect("dequeue"), second);
}

#[test]
fn new_consumer_starts_at_the_queue_head() {
    let tmp = TempDir::new().expect("tempdir");
    let queue = open_queue(tmp.path(), 4096);

    queue.enqueue(b"before").expect("enqueue");
    // the default consumer is still at the queue head, so a new consumer
    // starts there too and sees the record
    let late = queue.consumer("late").expect("consumer");
    assert_eq!(late.dequeue().expect("dequeue"), b"before");
}

#[test]
fn capped_queue_stays_within_its_arena_cap() {
    let tmp = TempDir::new().expect("tempdir");
    let arena_size = 4096u64;
    let payload_len = (arena_size * 4) as usize;
    let message = |i: usize| vec![i as u8; payload_len];

    let cap_holds = |queue: &MmapQueue| {
        let mapped = queue.in_memory_arenas();
        assert!(mapped <= 3, "{mapped} arenas mapped, cap is 3");
    };

    {
        let queue = QueueOptions::new()
            .arena_size(arena_size)
            .expect("arena size")
            .max_in_memory_arenas(3)
            .expect("cap")
            .open(tmp.path())
            .expect("open");

        for i in 0..11 {
            queue.enqueue(&message(i)).expect("enqueue");
            cap_holds(&queue);
        }
        for i in 0..5 {
            assert_eq!(queue.dequeue().expect("dequeue"), message(i));
            cap_holds(&queue);
        }
        for i in 11..16 {
            queue.enqueue(&message(i)).expect("enqueue");
            cap_holds(&queue);
        }
        queue.close().expect("close");
    }

    let queue = QueueOptions::new()
        .arena_size(arena_size)
        .expect("arena size")
        .max_in_memory_arenas(3)
        .expect("cap")
        .open(tmp.path())
        .expect("reopen");

    for i in 5..16 {
        assert_eq!(queue.dequeue().expect("dequeue"), message(i));
        cap_holds(&queue);
    }
    assert!(queue.is_empty());
}

#[test]
fn consumed_arena_files_are_deleted() {
    let tmp = TempDir::new().expect("tempdir");
    let queue = open_queue(tmp.path(), 4096);

    // three records, each filling one arena exactly
    for i in 0u8..3 {
        queue.enqueue(&vec![i; 4088]).expect("enqueue");
    }
    assert!(tmp.path().join("arena_0.dat").exists());

    queue.dequeue().expect("dequeue");
    queue.dequeue().expect("dequeue");
    assert!(!tmp.path().join("arena_0.dat").exists());
    assert!(!tmp.path().join("arena_1.dat").exists());
    assert!(tmp.path().join("arena_2.dat").exists());
}

#[test]
fn lagging_consumer_keeps_arena_files_alive() {
    let tmp = TempDir::new().expect("tempdir");
    let queue = open_queue(tmp.path(), 4096);
    let lagging = queue.consumer("lagging").expect("consumer");

    for i in 0u8..3 {
        queue.enqueue(&vec![i; 4088]).expect("enqueue");
    }
    queue.dequeue().expect("dequeue");
    queue.dequeue().expect("dequeue");

    // the lagging consumer still references arena 0
    assert!(tmp.path().join("arena_0.dat").exists());

    lagging.dequeue().expect("dequeue");
    lagging.dequeue().expect("dequeue");
    assert!(!tmp.path().join("arena_0.dat").exists());
    assert!(!tmp.path().join("arena_1.dat").exists());
}

#[test]
fn uncapped_queue_accepts_a_burst() {
    let tmp = TempDir::new().expect("tempdir");
    let queue = QueueOptions::new()
        .arena_size(4096)
        .expect("arena size")
        .max_in_memory_arenas(0)
        .expect("uncapped")
        .open(tmp.path())
        .expect("open");

    let payload = vec![b'x'; 40_000];
    for _ in 0..8 {
        queue.enqueue(&payload).expect("enqueue");
    }
    for _ in 0..8 {
        assert_eq!(queue.dequeue().expect("dequeue"), payload);
    }
}

#[test]
fn config_struct_open_validates_at_open_time() {
    let tmp = TempDir::new().expect("tempdir");
    let config = QueueConfig {
        max_in_memory_arenas: 2,
        ..QueueConfig::default()
    };
    let err = QueueOptions::from_config(config).open(tmp.path()).unwrap_err();
    assert!(matches!(err, QueueError::TooFewInMemoryArenas(2)));
}
