// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process facts recorded in the event envelope: memory usage, hostname and OS.
//!
//! Memory figures come from `/proc/self/status` (`VmRSS` for current, `VmHWM` for peak).
//! On platforms without `/proc` they read as zero, which keeps the memory filter inert.

use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader};

use tracing::{debug, warn};

const PROC_SELF_STATUS_PATH: &str = "/proc/self/status";

/// Resident memory of the current process, in bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub current_bytes: u64,
    pub peak_bytes: u64,
}

#[must_use]
pub fn get_memory_usage() -> MemoryUsage {
    get_memory_usage_from_path(PROC_SELF_STATUS_PATH).unwrap_or_else(|e| {
        debug!("Could not read memory usage: {e}");
        MemoryUsage::default()
    })
}

/// Parses the `VmRSS` and `VmHWM` lines (reported in kB) of a `/proc/<pid>/status` file.
pub fn get_memory_usage_from_path(path: &str) -> Result<MemoryUsage, io::Error> {
    let reader = BufReader::new(File::open(path)?);
    let mut usage = MemoryUsage::default();
    let mut found = false;

    for line in reader.lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kb) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "VmRSS:" => {
                usage.current_bytes = kb * 1024;
                found = true;
            }
            "VmHWM:" => {
                usage.peak_bytes = kb * 1024;
                found = true;
            }
            _ => {}
        }
    }

    if !found {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "VmRSS/VmHWM not found in status file",
        ));
    }
    // VmHWM can lag behind VmRSS by a sampling tick
    usage.peak_bytes = usage.peak_bytes.max(usage.current_bytes);
    Ok(usage)
}

/// Get the system hostname
///
/// 1. `HOSTNAME` environment variable
/// 2. System hostname via `gethostname()`
/// 3. Fallback to `"unknown"`
#[must_use]
pub fn get_hostname() -> String {
    if let Ok(hostname) = env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => {
            if let Some(hostname) = hostname.to_str() {
                if !hostname.is_empty() {
                    return hostname.to_string();
                }
            }
        }
        Err(e) => warn!("Failed to get system hostname: {}", e),
    }

    "unknown".to_string()
}

/// Kernel name and release, e.g. `("Linux", "6.1.0")`.
#[must_use]
#[cfg(unix)]
pub fn get_os_info() -> (String, String) {
    match nix::sys::utsname::uname() {
        Ok(uts) => (
            uts.sysname().to_string_lossy().into_owned(),
            uts.release().to_string_lossy().into_owned(),
        ),
        Err(e) => {
            debug!("uname failed: {e}");
            (env::consts::OS.to_string(), String::new())
        }
    }
}

#[must_use]
#[cfg(not(unix))]
pub fn get_os_info() -> (String, String) {
    (env::consts::OS.to_string(), String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn status_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_status_file() {
        let file = status_file(
            "Name:\tmyapp\nVmPeak:\t  300000 kB\nVmHWM:\t    2048 kB\nVmRSS:\t    1024 kB\nThreads:\t4\n",
        );
        let usage = get_memory_usage_from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(usage.current_bytes, 1024 * 1024);
        assert_eq!(usage.peak_bytes, 2048 * 1024);
    }

    #[test]
    fn test_peak_never_below_current() {
        let file = status_file("VmHWM:\t 10 kB\nVmRSS:\t 20 kB\n");
        let usage = get_memory_usage_from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(usage.peak_bytes, 20 * 1024);
    }

    #[test]
    fn test_status_file_without_memory_lines() {
        let file = status_file("Name:\tmyapp\nThreads:\t4\n");
        assert!(get_memory_usage_from_path(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_missing_status_file() {
        assert!(get_memory_usage_from_path("/definitely/not/here").is_err());
    }

    #[test]
    fn test_hostname_is_never_empty() {
        assert!(!get_hostname().is_empty());
    }
}
