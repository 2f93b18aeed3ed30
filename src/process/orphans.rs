//! Detection of capture processes left behind by an earlier run
//!
//! A capture program that outlived its parent keeps the ALSA device open and
//! makes every new capture fail with "Device or resource busy". They are found
//! by reading `/proc/<pid>/cmdline`.

use std::path::Path;

/// Whether a command line runs `program` against `device`
pub fn cmdline_targets_device(args: &[String], program: &str, device: &str) -> bool {
    let Some(first) = args.first() else {
        return false;
    };
    if basename(first) != basename(program) {
        return false;
    }

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "-D" || arg == "--device" {
            if iter.next().map(String::as_str) == Some(device) {
                return true;
            }
        } else if let Some(value) = arg.strip_prefix("--device=") {
            if value == device {
                return true;
            }
        } else if let Some(value) = arg.strip_prefix("-D") {
            if value == device {
                return true;
            }
        }
    }
    false
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Split a raw `/proc/<pid>/cmdline` into arguments
pub fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

/// PIDs under `proc_root` running `program` bound to `device`
///
/// Processes that vanish or cannot be read during the scan are skipped.
pub fn scan(proc_root: &Path, program: &str, device: &str) -> Vec<u32> {
    let entries = match std::fs::read_dir(proc_root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot scan {:?} for leftover processes: {}", proc_root, e);
            return Vec::new();
        }
    };

    let mut pids: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
            let raw = std::fs::read(entry.path().join("cmdline")).ok()?;
            cmdline_targets_device(&parse_cmdline(&raw), program, device).then_some(pid)
        })
        .collect();
    pids.sort_unstable();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_matches_separate_device_flag() {
        let cmd = args(&["/usr/bin/arecord", "-D", "plughw:1,0", "-c", "2"]);
        assert!(cmdline_targets_device(&cmd, "arecord", "plughw:1,0"));
        assert!(!cmdline_targets_device(&cmd, "arecord", "plughw:2,0"));
    }

    #[test]
    fn test_matches_joined_device_flags() {
        let cmd = args(&["arecord", "--device=hw:0"]);
        assert!(cmdline_targets_device(&cmd, "arecord", "hw:0"));

        let cmd = args(&["arecord", "-Dhw:0"]);
        assert!(cmdline_targets_device(&cmd, "/usr/bin/arecord", "hw:0"));
    }

    #[test]
    fn test_other_programs_are_ignored() {
        let cmd = args(&["aplay", "-D", "hw:0"]);
        assert!(!cmdline_targets_device(&cmd, "arecord", "hw:0"));
        assert!(!cmdline_targets_device(&[], "arecord", "hw:0"));
    }

    #[test]
    fn test_parse_cmdline() {
        let raw = b"arecord\0-D\0hw:0\0";
        assert_eq!(parse_cmdline(raw), args(&["arecord", "-D", "hw:0"]));
    }

    #[test]
    fn test_scan_fake_proc_tree() {
        let dir = tempfile::tempdir().unwrap();
        let write = |pid: &str, cmdline: &[u8]| {
            let path = dir.path().join(pid);
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join("cmdline"), cmdline).unwrap();
        };
        write("120", b"arecord\0-D\0bluealsa:DEV=AA\0");
        write("77", b"arecord\0-D\0bluealsa:DEV=AA\0-t\0raw\0");
        write("300", b"arecord\0-D\0hw:0\0");
        write("self", b"arecord\0-D\0bluealsa:DEV=AA\0");
        std::fs::create_dir_all(dir.path().join("999")).unwrap(); // no cmdline

        assert_eq!(scan(dir.path(), "arecord", "bluealsa:DEV=AA"), vec![77, 120]);
        assert!(scan(dir.path(), "arecord", "hw:5").is_empty());
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        assert!(scan(Path::new("/nonexistent/proc"), "arecord", "hw:0").is_empty());
    }
}
