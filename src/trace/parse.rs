//! Parser for `trace_pipe` lines.
//!
//! Line shape (flags column absent on older kernels):
//!
//! ```text
//!            bash-1234    [003] d..2. 12345.678901: sched_process_exec: filename=/bin/ls pid=1234 old_pid=1234
//!         python3-201     [001] ..... 12346.000001: sys_kill(pid: 0x000000c8, sig: 0x00000009)
//! ```

/// What a single trace line reported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Exec,
    Exit,
    Fork { child_pid: u32, child_comm: String },
    Kill { target: i32, sig: i32 },
}

/// A parsed trace line, before ppid/uid enrichment.
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeRecord {
    pub pid: u32,
    pub comm: String,
    /// Seconds on the trace clock.
    pub ktime: Option<f64>,
    pub kind: RecordKind,
}

/// Name of the kprobe event registered for exec when no tracepoint is usable.
pub const EXEC_KPROBE_EVENT: &str = "arenabox_exec";

/// Parse one line. `None` for lines that are not ours or are malformed.
pub fn parse_line(line: &str) -> Option<ProbeRecord> {
    let (task, rest) = split_task(line)?;
    let (comm, pid) = task.rsplit_once('-')?;
    let task_pid: u32 = pid.trim().parse().ok()?;
    let task_comm = comm.trim();

    let (ktime, body) = split_timestamp(rest)?;

    if let Some(args) = body.strip_prefix("sys_kill(") {
        let args = args.strip_suffix(')').unwrap_or(args);
        let target = hex_arg(args, "pid")? as i64 as i32;
        let sig = hex_arg(args, "sig")? as i64 as i32;
        return Some(ProbeRecord {
            pid: task_pid,
            comm: task_comm.to_string(),
            ktime,
            kind: RecordKind::Kill { target, sig },
        });
    }

    let (event, payload) = match body.split_once(':') {
        Some((event, payload)) => (event.trim(), payload.trim()),
        None => return None,
    };

    let record = |pid: u32, comm: &str, kind: RecordKind| ProbeRecord {
        pid,
        comm: comm.to_string(),
        ktime,
        kind,
    };

    match event {
        "sched_process_exec" => {
            let pid = field(payload, "pid")
                .and_then(|v| v.parse().ok())
                .unwrap_or(task_pid);
            Some(record(pid, task_comm, RecordKind::Exec))
        }
        EXEC_KPROBE_EVENT => Some(record(task_pid, task_comm, RecordKind::Exec)),
        "sched_process_exit" => {
            let pid = field(payload, "pid")
                .and_then(|v| v.parse().ok())
                .unwrap_or(task_pid);
            let comm = field(payload, "comm").unwrap_or(task_comm);
            Some(record(pid, comm, RecordKind::Exit))
        }
        "sched_process_fork" => {
            let parent = field(payload, "pid")
                .and_then(|v| v.parse().ok())
                .unwrap_or(task_pid);
            let comm = field(payload, "comm").unwrap_or(task_comm);
            let child_pid = field(payload, "child_pid")?.parse().ok()?;
            let child_comm = field(payload, "child_comm").unwrap_or(comm).to_string();
            Some(record(
                parent,
                comm,
                RecordKind::Fork {
                    child_pid,
                    child_comm,
                },
            ))
        }
        _ => None,
    }
}

/// Split `comm-pid [cpu]` from the rest of the line.
fn split_task(line: &str) -> Option<(&str, &str)> {
    for (idx, _) in line.match_indices(" [") {
        let after = &line[idx + 2..];
        let close = after.find(']')?;
        if close > 0 && after[..close].bytes().all(|b| b.is_ascii_digit()) {
            return Some((line[..idx].trim(), &after[close + 1..]));
        }
    }
    None
}

/// Find the `seconds.micros:` token and return what follows it.
fn split_timestamp(rest: &str) -> Option<(Option<f64>, &str)> {
    let mut offset = 0;
    for token in rest.split_whitespace() {
        let start = offset + rest[offset..].find(token)?;
        offset = start + token.len();
        if let Some(number) = token.strip_suffix(':') {
            if number.contains('.') {
                if let Ok(seconds) = number.parse::<f64>() {
                    return Some((Some(seconds), rest[offset..].trim()));
                }
            }
        }
    }
    None
}

/// `key=value` lookup in a tracepoint payload.
fn field<'a>(payload: &'a str, key: &str) -> Option<&'a str> {
    payload
        .split_whitespace()
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// `key: 0x...` lookup in a syscall tracepoint argument list.
fn hex_arg(args: &str, key: &str) -> Option<u64> {
    args.split(',').find_map(|part| {
        let (k, v) = part.split_once(':')?;
        if k.trim() != key {
            return None;
        }
        let v = v.trim();
        let digits = v.strip_prefix("0x").unwrap_or(v);
        u64::from_str_radix(digits, 16).ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exec_tracepoint() {
        let line = "            bash-1234    [003] d..2. 12345.678901: sched_process_exec: filename=/bin/ls pid=1234 old_pid=1234";
        let record = parse_line(line).unwrap();
        assert_eq!(record.pid, 1234);
        assert_eq!(record.comm, "bash");
        assert_eq!(record.kind, RecordKind::Exec);
        assert!((record.ktime.unwrap() - 12345.678901).abs() < 1e-6);
    }

    #[test]
    fn parses_kill_with_group_target() {
        let line = "         python3-201     [001] ..... 12346.000001: sys_kill(pid: 0xffffffffffffff38, sig: 0x00000009)";
        let record = parse_line(line).unwrap();
        assert_eq!(record.pid, 201);
        assert_eq!(record.kind, RecordKind::Kill { target: -200, sig: 9 });
    }

    #[test]
    fn parses_kill_without_hex_prefix_and_flags_column() {
        let line = "  kill-77 [000] 99.5: sys_kill(pid: c8, sig: 0)";
        let record = parse_line(line).unwrap();
        assert_eq!(record.kind, RecordKind::Kill { target: 200, sig: 0 });
    }

    #[test]
    fn parses_exit_and_fork_and_task_names_with_dashes() {
        let exit = parse_line(
            "   my-agent-3-501 [002] ..... 10.000100: sched_process_exit: comm=my-agent-3 pid=501 prio=120 group_dead=1",
        )
        .unwrap();
        assert_eq!(exit.pid, 501);
        assert_eq!(exit.comm, "my-agent-3");
        assert_eq!(exit.kind, RecordKind::Exit);

        let fork = parse_line(
            "   sh-500 [002] ..... 10.000001: sched_process_fork: comm=sh pid=500 child_comm=sh child_pid=501",
        )
        .unwrap();
        assert_eq!(fork.pid, 500);
        assert_eq!(
            fork.kind,
            RecordKind::Fork {
                child_pid: 501,
                child_comm: "sh".into()
            }
        );
    }

    #[test]
    fn parses_kprobe_exec() {
        let line = format!(
            "   su-300 [000] d.... 5.250000: {}: (__x64_sys_execve+0x0/0x50)",
            EXEC_KPROBE_EVENT
        );
        let record = parse_line(&line).unwrap();
        assert_eq!(record.pid, 300);
        assert_eq!(record.kind, RecordKind::Exec);
    }

    #[test]
    fn rejects_noise() {
        assert!(parse_line("").is_none());
        assert!(parse_line("CPU:3 [LOST 12 EVENTS]").is_none());
        assert!(parse_line("  bash-1 [000] ..... 1.0: sched_switch: prev_comm=bash").is_none());
        assert!(parse_line("  bash-x [000] ..... 1.0: sched_process_exec: pid=1").is_none());
        assert!(parse_line("  bash-1 [000] ..... 1.0: sys_kill(sig: 0x9)").is_none());
    }
}
