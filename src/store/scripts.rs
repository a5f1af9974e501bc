//! Server-side scripts.
//!
//! Each script is built once; `redis::Script` invokes by digest and loads the
//! body on a `NOSCRIPT` reply.

use std::sync::OnceLock;

use redis::Script;

const RECLAIM_SOURCE: &str = include_str!("reclaim.lua");
const ACQUIRE_LOCK_SOURCE: &str = include_str!("acquire_lock.lua");

/// Per-queue reclamation sweep.
pub fn reclaim() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(RECLAIM_SOURCE))
}

/// Compare-and-set acquisition of one pool lock slot.
pub fn acquire_lock() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(ACQUIRE_LOCK_SOURCE))
}
