//! Built-in demonstration workload
//!
//! One iteration per domain: allocate a word on the domain, remotely spawn
//! a handler there that fills it, then read the word back. Optionally the
//! first `fail` iterations inject a failure on their remote side, so that
//! the launcher can show how errors travel back to the top-level task.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::runtime::comm::HandlerRegistry;
use crate::runtime::domain::{Cluster, DomainId};
use crate::runtime::errors::{RuntimeResult, TaskError};
use crate::runtime::group::{coforall, TaskGroup};
use crate::runtime::memory::LocalHandle;

/// Handler that writes a word into its own domain's memory.
pub const FILL_HANDLER: &str = "fanout.fill";

const ARGS_LEN: usize = 33;

/// Value written on domain `index`.
pub fn expected_value(index: usize) -> u64 {
    1000 + index as u64
}

/// Register the workload's handlers.
pub fn register(handlers: &mut HandlerRegistry) {
    handlers.register(FILL_HANDLER, |domain, ctx, args| {
        let (handle, value, fail) = decode_args(args)?;
        debug!("{} filling {} on {}", ctx.id(), handle, domain.id());
        if fail {
            return Err(TaskError::raised(format!("injected failure on {}", domain.id())));
        }
        domain
            .memory()
            .write(handle, 0, &value.to_le_bytes())
            .map_err(|err| TaskError::raised(err.to_string()))
    });
}

fn encode_args(
    handle: LocalHandle,
    value: u64,
    fail: bool,
) -> Vec<u8> {
    let mut args = Vec::with_capacity(ARGS_LEN);
    args.extend_from_slice(&handle.segment.to_le_bytes());
    args.extend_from_slice(&(handle.offset as u64).to_le_bytes());
    args.extend_from_slice(&(handle.len as u64).to_le_bytes());
    args.extend_from_slice(&value.to_le_bytes());
    args.push(fail as u8);
    args
}

fn decode_args(args: &[u8]) -> Result<(LocalHandle, u64, bool), TaskError> {
    if args.len() != ARGS_LEN {
        return Err(TaskError::raised(format!(
            "{}: expected {} argument bytes, got {}",
            FILL_HANDLER,
            ARGS_LEN,
            args.len()
        )));
    }
    let word = |i: usize| {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&args[i * 8..i * 8 + 8]);
        u64::from_le_bytes(bytes)
    };
    let handle = LocalHandle {
        segment: word(0),
        offset: word(1) as usize,
        len: word(2) as usize,
    };
    Ok((handle, word(3), args[32] != 0))
}

/// Run the workload on `cluster`. Returns the word read back from each
/// domain, in domain order.
pub fn run(
    cluster: &Cluster,
    fail: usize,
) -> RuntimeResult<Vec<u64>> {
    let n = cluster.num_domains();
    let home = cluster.domain(DomainId(0))?.clone();
    let results = Arc::new(Mutex::new(vec![0u64; n]));
    let out = results.clone();

    cluster.run_main(move |domain, ctx| {
        info!("fanout over {} domain(s) from {}", n, ctx.id());
        coforall(domain.pool(), 0..n, move |index, ctx| {
            let endpoint = home.endpoint();
            let target = DomainId(index as u32);
            let addr = endpoint.alloc_blocking(target, 8)?;

            let group = TaskGroup::unbounded(ctx.pool());
            endpoint.remote_spawn(
                &group,
                target,
                FILL_HANDLER,
                encode_args(addr.handle(), expected_value(index), index < fail),
            )?;
            let joined = group.join();

            let bytes = endpoint.get_blocking(addr)?;
            endpoint.free_blocking(addr)?;
            joined?;

            let mut word = [0; 8];
            word.copy_from_slice(&bytes[..8]);
            out.lock()[index] = u64::from_le_bytes(word);
            Ok(())
        })?;
        Ok(())
    })?;

    let values = results.lock().clone();
    Ok(values)
}
