use std::time::Duration;
use topolenum::spill::{SharedSpillFifo, SpillOptions};
use test_log::test;

/// Producer and consumer in different threads, with the file cap forcing
/// several rollovers; every payload must come out in order and the
/// workspace directory must be gone after both ends close.
#[test]
fn cross_thread_rollover_and_teardown() -> topolenum::Result<()> {
    let holder = tempfile::tempdir()?;

    // Frames are 1 + 8 bytes; a 25-byte cap rolls over every third push,
    // so 64 payloads force well over three rollovers
    let fifo = SharedSpillFifo::new(SpillOptions {
        max_file_size: 25,
        size_check_delay: 0,
        dir: Some(holder.path().to_path_buf()),
    })?;

    let consumer = fifo.clone();
    let consumer_handle = std::thread::spawn(move || -> topolenum::Result<Vec<u64>> {
        consumer.start_out_end()?;

        let mut seen = vec![];
        while seen.len() < 64 {
            if let Some(payload) = consumer.pop(Duration::from_millis(200))? {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&payload);
                seen.push(u64::from_le_bytes(buf));
            }
        }

        consumer.close_out()?;
        Ok(seen)
    });

    fifo.start_in_end()?;
    for i in 0..64u64 {
        fifo.push(&i.to_le_bytes())?;
    }
    fifo.close_in()?;

    let seen = consumer_handle.join().expect("consumer should not panic")?;
    assert_eq!((0..64).collect::<Vec<u64>>(), seen);

    // Reading end discards files, writing end removes the workspace
    assert_eq!(0, std::fs::read_dir(holder.path())?.count());

    Ok(())
}

#[test]
fn consumer_blocks_until_data_arrives() -> topolenum::Result<()> {
    let fifo = SharedSpillFifo::new(SpillOptions::default())?;

    let consumer = fifo.clone();
    let consumer_handle = std::thread::spawn(move || -> topolenum::Result<Vec<Vec<u8>>> {
        consumer.start_out_end()?;

        let mut seen = vec![];
        while seen.len() < 3 {
            if let Some(payload) = consumer.pop(Duration::from_secs(5))? {
                seen.push(payload);
            }
        }

        consumer.close_out()?;
        Ok(seen)
    });

    fifo.start_in_end()?;
    for payload in [b"one".as_slice(), b"two", b"three"] {
        std::thread::sleep(Duration::from_millis(20));
        fifo.push(payload)?;
    }
    fifo.close_in()?;

    let seen = consumer_handle.join().expect("consumer should not panic")?;
    assert_eq!(
        vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()],
        seen,
    );

    Ok(())
}

#[test]
fn batch_push_keeps_order() -> topolenum::Result<()> {
    let fifo = SharedSpillFifo::new(SpillOptions::default())?;

    let consumer = fifo.clone();
    let consumer_handle = std::thread::spawn(move || -> topolenum::Result<Vec<Vec<u8>>> {
        consumer.start_out_end()?;

        let mut seen = vec![];
        while seen.len() < 4 {
            if let Some(payload) = consumer.pop(Duration::from_secs(5))? {
                seen.push(payload);
            }
        }

        consumer.close_out()?;
        Ok(seen)
    });

    fifo.start_in_end()?;
    let batch: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 3]).collect();
    fifo.push_all(batch.iter().map(Vec::as_slice))?;
    fifo.close_in()?;

    let seen = consumer_handle.join().expect("consumer should not panic")?;
    assert_eq!(batch, seen);

    Ok(())
}
