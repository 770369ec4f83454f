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

//! Unit conversion utilities

use crate::common::config::AppConfig;

/// Convert bytes to whole mebibytes, truncating
#[inline]
pub fn bytes_to_mib(bytes: u64) -> u64 {
    bytes / AppConfig::BYTES_PER_MIB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_mib() {
        assert_eq!(bytes_to_mib(0), 0);
        assert_eq!(bytes_to_mib(1024 * 1024), 1);
        assert_eq!(bytes_to_mib(3 * 1024 * 1024 - 1), 2);
        assert_eq!(bytes_to_mib(32 * 1024 * 1024 * 1024), 32768);
    }
}
