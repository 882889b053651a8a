#![no_main]

//! Replays fuzzer-chosen edits from three replicas in two delivery orders
//! and asserts both replicas end with the same text.

use libfuzzer_sys::fuzz_target;
use mesh_crdt::core::{IdAllocator, Sequence, SequenceOp};

fn generate(data: &[u8]) -> Vec<SequenceOp<char>> {
    let mut replicas: Vec<(Sequence<char>, IdAllocator)> = (1..=3)
        .map(|id| (Sequence::new(), IdAllocator::new(id)))
        .collect();
    let mut ops: Vec<SequenceOp<char>> = Vec::new();

    for chunk in data.chunks_exact(3) {
        let replica = (chunk[0] % 3) as usize;
        let (seq, alloc) = &mut replicas[replica];
        let len = seq.len_visible();
        match chunk[1] % 4 {
            0 | 1 => {
                let at = chunk[2] as usize % (len + 1);
                if let Ok(op) = seq.local_insert(alloc, at, char::from(b'a' + chunk[2] % 26)) {
                    ops.push(op);
                }
            }
            2 if len > 0 => {
                if let Ok(deleted) = seq.local_delete(alloc, chunk[2] as usize % len, 1) {
                    ops.extend(deleted);
                }
            }
            _ => {
                for op in &ops {
                    let _ = seq.apply_remote(op.clone());
                }
            }
        }
    }
    ops
}

fuzz_target!(|data: &[u8]| {
    let ops = generate(data);

    let mut forward = Sequence::new();
    for op in &ops {
        let _ = forward.apply_remote(op.clone());
    }
    let mut backward = Sequence::new();
    for op in ops.iter().rev() {
        let _ = backward.apply_remote(op.clone());
    }

    assert_eq!(forward.to_text(), backward.to_text());
    assert_eq!(backward.pending_len(), 0);
});
