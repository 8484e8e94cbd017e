use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use nix::unistd::Pid;
use tracing::{debug, trace};

use super::Result;

/// Upper bound for single `/proc` file reads. `stat` and `cmdline` are well
/// under this in practice.
const MAX_PROC_READ: usize = 8192;

/// One process as seen in a process-table snapshot. Valid only at capture
/// time; any later operation on the pid must tolerate "no longer exists".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: Pid,
    pub ppid: Pid,
    pub pgid: Pid,
    pub cmdline: String,
}

/// Capability for taking a process-table snapshot.
///
/// The harness only ever reads the table; termination goes through the
/// escalation protocol, never through the inspector.
pub trait ProcessInspector {
    /// Lists all same-privilege processes visible on the host.
    fn snapshot(&self) -> Result<Vec<ProcessRecord>>;
}

/// `/proc`-based inspector for Linux hosts.
pub struct ProcInspector;

impl ProcessInspector for ProcInspector {
    fn snapshot(&self) -> Result<Vec<ProcessRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir("/proc")? {
            let entry = match entry {
                Ok(entry) => entry,
                // Entries racing with process exit are not errors.
                Err(_) => continue,
            };
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            if let Some(record) = read_record(&entry.path(), Pid::from_raw(pid)) {
                records.push(record);
            }
        }
        trace!(count = records.len(), "process table snapshot");
        Ok(records)
    }
}

/// Parses one `/proc/<pid>` directory. Returns `None` when the process
/// vanished mid-scan or its stat line is unparseable.
fn read_record(dir: &Path, pid: Pid) -> Option<ProcessRecord> {
    let stat = read_bounded(&dir.join("stat"))?;
    // The comm field is parenthesised and may itself contain parentheses and
    // spaces; everything after the last ')' is fixed-position.
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    let ppid: i32 = fields.next()?.parse().ok()?;
    let pgid: i32 = fields.next()?.parse().ok()?;

    let cmdline = read_bounded(&dir.join("cmdline"))
        .map(|raw| raw.replace('\0', " ").trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            // Kernel threads have an empty cmdline; fall back to the comm.
            let open = stat.find('(').map(|i| i + 1).unwrap_or(0);
            let close = stat.rfind(')').unwrap_or(stat.len());
            format!("[{}]", &stat[open..close])
        });

    Some(ProcessRecord {
        pid,
        ppid: Pid::from_raw(ppid),
        pgid: Pid::from_raw(pgid),
        cmdline,
    })
}

fn read_bounded(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let bytes = if bytes.len() > MAX_PROC_READ {
        &bytes[..MAX_PROC_READ]
    } else {
        &bytes[..]
    };
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// The processes transitively owned by a root pid at snapshot time.
///
/// A record belongs iff its parent is the root, its process group is a
/// tracked group, or its parent is itself (transitively) in the set.
#[derive(Debug, Clone)]
pub struct ProcessSet {
    root: Pid,
    records: Vec<ProcessRecord>,
}

impl ProcessSet {
    pub fn root(&self) -> Pid {
        self.root
    }

    pub fn records(&self) -> &[ProcessRecord] {
        &self.records
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.records.iter().map(|record| record.pid).collect()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.records.iter().any(|record| record.pid == pid)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Discovers the process tree owned by `root` from a fresh snapshot.
///
/// `extra_groups` are tracked in addition to the root's own process group;
/// `excluded` pids (the harness itself, separately-managed helper processes)
/// never join the set even when the closure would reach them.
pub fn discover(
    inspector: &dyn ProcessInspector,
    root: Pid,
    extra_groups: &[Pid],
    excluded: &[Pid],
) -> Result<ProcessSet> {
    let snapshot = inspector.snapshot()?;
    let excluded: HashSet<Pid> = excluded.iter().copied().collect();

    let mut groups: HashSet<Pid> = extra_groups.iter().copied().collect();
    groups.insert(root);

    let mut members: HashMap<Pid, ProcessRecord> = HashMap::new();
    if let Some(record) = snapshot.iter().find(|r| r.pid == root) {
        if !excluded.contains(&root) {
            members.insert(root, record.clone());
        }
    }

    // Fixed point of the ownership closure: group membership short-circuits,
    // otherwise follow parent links into the set.
    loop {
        let mut changed = false;
        for record in &snapshot {
            if members.contains_key(&record.pid) || excluded.contains(&record.pid) {
                continue;
            }
            let owned = record.ppid == root
                || groups.contains(&record.pgid)
                || members.contains_key(&record.ppid);
            if owned {
                members.insert(record.pid, record.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut records: Vec<ProcessRecord> = members.into_values().collect();
    records.sort_by_key(|record| record.pid);
    debug!(%root, count = records.len(), "discovered process set");
    Ok(ProcessSet { root, records })
}
