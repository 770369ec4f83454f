// Copyright 2025 ix-exporter developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Host procfs as mounted into the exporter container.
pub const HOST_PROC: &str = "/host-proc";
pub const PROC: &str = "/proc";

static CONTAINERIZED: Lazy<bool> = Lazy::new(detect_container);

fn detect_container() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }
    fs::read_to_string("/proc/1/cgroup")
        .map(|content| cgroup_is_containerized(&content))
        .unwrap_or(false)
}

fn cgroup_is_containerized(content: &str) -> bool {
    content
        .lines()
        .any(|line| line.contains("docker") || line.contains("kubepods"))
}

/// Whether the exporter itself runs inside a container.
pub fn is_containerized() -> bool {
    *CONTAINERIZED
}

/// Looks up process command lines under a procfs root.
#[derive(Debug, Clone)]
pub struct ProcessNameResolver {
    proc_root: PathBuf,
}

impl ProcessNameResolver {
    /// `/host-proc` inside a container, `/proc` otherwise.
    pub fn detect() -> Self {
        let root = if is_containerized() { HOST_PROC } else { PROC };
        Self::with_root(root)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    /// Command line of `pid` with arguments joined by spaces, or an empty
    /// string when it cannot be read.
    pub fn name(&self, pid: u32) -> String {
        let path = self.proc_root.join(pid.to_string()).join("cmdline");
        match fs::read(&path) {
            Ok(data) => String::from_utf8_lossy(&data)
                .split('\0')
                .filter(|arg| !arg.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
            Err(e) => {
                tracing::warn!("Error reading {} for pid {pid}: {e}", path.display());
                String::new()
            }
        }
    }
}
