//! Property tests for the execution registry's hard ceiling.

use std::sync::Arc;

use proptest::prelude::*;
use sandbox_runtime::{ActiveExecution, ExecutionId, ExecutionRegistry, ResourceLimits, ScriptRef, TierKind};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
enum Op {
    Register,
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Register), (0usize..16).prop_map(Op::Release)]
}

fn entry() -> ActiveExecution {
    ActiveExecution::new(
        ExecutionId::new(),
        ResourceLimits::default(),
        TierKind::Rlimit,
        "alice",
        ScriptRef::new("alice/s.py"),
        CancellationToken::new(),
    )
}

proptest! {
    /// Whatever the interleaving, the registry never holds more than its
    /// ceiling and every released lease is gone.
    #[test]
    fn ceiling_is_never_exceeded(max in 1usize..8, ops in prop::collection::vec(op(), 1..64)) {
        let registry = Arc::new(ExecutionRegistry::new(max));
        let mut leases = Vec::new();

        for op in ops {
            match op {
                Op::Register => match registry.register(entry()) {
                    Ok(lease) => leases.push(lease),
                    Err(_) => prop_assert_eq!(leases.len(), max),
                },
                Op::Release(idx) if !leases.is_empty() => {
                    let lease = leases.swap_remove(idx % leases.len());
                    let id = lease.execution_id();
                    drop(lease);
                    prop_assert!(!registry.contains(&id));
                }
                Op::Release(_) => {}
            }
            prop_assert!(registry.len() <= max);
            prop_assert_eq!(registry.len(), leases.len());
        }

        leases.clear();
        prop_assert!(registry.is_empty());
    }
}
