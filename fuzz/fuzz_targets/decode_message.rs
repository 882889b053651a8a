#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_crdt::core::Sequence;
use mesh_crdt::sync::{SyncMessage, ValidationLimits};

fuzz_target!(|data: &[u8]| {
    if let Ok(SyncMessage::OperationBatch { ops }) =
        SyncMessage::decode(data, &ValidationLimits::default())
    {
        let mut seq = Sequence::new();
        for op in ops {
            let _ = seq.apply_remote(op);
        }
        let _ = seq.to_text();
    }
});
