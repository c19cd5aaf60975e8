//
// running_kernels.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! The process-wide registry of live kernel channel engines, indexed by
//! kernel ID. Initialized lazily; mutated only by engine constructors and
//! disposers.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::kernel_connection::KernelConnection;

static RUNNING_KERNELS: OnceLock<Mutex<HashMap<String, KernelConnection>>> = OnceLock::new();

pub(crate) fn registry() -> &'static Mutex<HashMap<String, KernelConnection>> {
    RUNNING_KERNELS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Find the live channel engine for a kernel ID, if this process has one.
pub fn find_running_kernel(id: &str) -> Option<KernelConnection> {
    let registry = registry().lock().unwrap();
    registry
        .get(id)
        .filter(|kernel| !kernel.is_disposed())
        .cloned()
}

pub(crate) fn remove(id: &str) {
    if let Some(registry) = RUNNING_KERNELS.get() {
        registry.lock().unwrap().remove(id);
    }
}
