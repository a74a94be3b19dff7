use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::VecDeque;
use topolenum::spill::{SpillFifo, SpillOptions};
use test_log::test;

#[test]
fn integer_payload_lifecycle() -> topolenum::Result<()> {
    // Each frame is 1 length byte + 4 payload bytes; 17 bytes hold 4
    // frames before the size check trips
    let mut fifo = SpillFifo::new(SpillOptions {
        max_file_size: 17,
        size_check_delay: 0,
        dir: None,
    })?;
    fifo.start_out_end()?;
    fifo.start_in_end()?;

    for i in 0..10u32 {
        fifo.push(&i.to_le_bytes())?;
        if i == 4 {
            assert_eq!(2, fifo.file_count());
        }
    }

    for i in 0..10u32 {
        assert_eq!(Some(i.to_le_bytes().to_vec()), fifo.pop()?);
        if i == 4 {
            assert_eq!(2, fifo.file_count());
        }
    }
    assert_eq!(1, fifo.file_count());
    assert_eq!(None, fifo.pop()?);

    fifo.close()
}

#[test]
fn close_removes_workspace() -> topolenum::Result<()> {
    let holder = tempfile::tempdir()?;

    let mut fifo = SpillFifo::new(SpillOptions {
        max_file_size: 1_024,
        size_check_delay: 0,
        dir: Some(holder.path().to_path_buf()),
    })?;
    fifo.start_out_end()?;
    fifo.start_in_end()?;
    fifo.push(b"payload")?;

    assert_eq!(1, std::fs::read_dir(holder.path())?.count());
    fifo.close()?;
    assert_eq!(0, std::fs::read_dir(holder.path())?.count());

    Ok(())
}

/// Random payload sizes and a random push/pop interleaving across a cap
/// small enough to force rollovers every few pushes; pops must still
/// return every payload in push order.
#[test]
fn randomized_interleaving_preserves_order() -> topolenum::Result<()> {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut fifo = SpillFifo::new(SpillOptions {
        max_file_size: 96,
        size_check_delay: 0,
        dir: None,
    })?;
    fifo.start_out_end()?;
    fifo.start_in_end()?;

    let mut pending: VecDeque<Vec<u8>> = VecDeque::new();
    let mut pushed = 0usize;

    while pushed < 500 || !pending.is_empty() {
        let push_turn = pushed < 500 && (pending.is_empty() || rng.random_bool(0.6));

        if push_turn {
            let len = rng.random_range(0..48);
            let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            fifo.push(&payload)?;
            pending.push_back(payload);
            pushed += 1;
        } else {
            // Single-threaded and flushed per frame, so queued data is
            // always visible to the reading end
            let popped = fifo.pop()?.expect("queued payload should be readable");
            assert_eq!(pending.pop_front(), Some(popped));
        }
    }

    assert_eq!(None, fifo.pop()?);
    assert_eq!(1, fifo.file_count());

    fifo.close()
}

#[test]
fn partial_drain_then_refill() -> topolenum::Result<()> {
    let mut fifo = SpillFifo::new(SpillOptions {
        max_file_size: 64,
        size_check_delay: 0,
        dir: None,
    })?;
    fifo.start_out_end()?;
    fifo.start_in_end()?;

    for i in 0..8u32 {
        fifo.push(&i.to_le_bytes())?;
    }
    for i in 0..4u32 {
        assert_eq!(Some(i.to_le_bytes().to_vec()), fifo.pop()?);
    }
    for i in 8..12u32 {
        fifo.push(&i.to_le_bytes())?;
    }
    for i in 4..12u32 {
        assert_eq!(Some(i.to_le_bytes().to_vec()), fifo.pop()?);
    }
    assert_eq!(None, fifo.pop()?);

    fifo.close()
}
