//
// kernel_spec.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// From the Jupyter documentation for [Kernel Specs](https://jupyter-client.readthedocs.io/en/stable/kernels.html#kernel-specs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    /// The kernel name, as registered with the server
    pub name: String,

    /// The kernel name as it should be displayed in the UI
    pub display_name: String,

    /// The kernel's language
    pub language: String,

    /// List of command line arguments to be used to start the kernel
    #[serde(default)]
    pub argv: Vec<String>,

    /// Environment variables to set for the kernel
    #[serde(default)]
    pub env: serde_json::Map<String, Value>,

    /// Resource files associated with the kernel (logos, etc.), keyed by name
    #[serde(default)]
    pub resources: HashMap<String, String>,
}

/// The bundle of kernel specs returned by the server's spec endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecsBundle {
    /// The name of the default kernel spec
    pub default: String,

    /// All installed kernel specs, keyed by name
    pub kernelspecs: HashMap<String, KernelSpec>,
}

impl SpecsBundle {
    /// Check the bundle for internal consistency; the advertised default must
    /// name one of the installed specs.
    pub fn validate(&self) -> Result<(), String> {
        if self.kernelspecs.contains_key(&self.default) {
            Ok(())
        } else {
            Err(format!(
                "default kernel spec '{}' is not among the installed specs",
                self.default
            ))
        }
    }
}
