use std::path::Path;

/// Raw accounting counters for one container.
///
/// `cpu_ns` is cumulative CPU time in nanoseconds, `memory_bytes` the
/// current memory charge. Missing or unreadable files read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub cpu_ns: u64,
    pub memory_bytes: u64,
}

/// Read counters from the cgroup v1 hierarchy used by classic LXC
/// (`cpu/lxc/<name>/cpuacct.usage`, `memory/lxc/<name>/memory.usage_in_bytes`),
/// falling back to the unified v2 layout (`lxc.payload.<name>/`).
pub(crate) async fn read_counters(root: &Path, name: &str) -> Counters {
    let v1_cpu = root.join("cpu/lxc").join(name).join("cpuacct.usage");
    let v1_mem = root.join("memory/lxc").join(name).join("memory.usage_in_bytes");
    let v2_dir = root.join(format!("lxc.payload.{name}"));

    let cpu_ns = match read_to_string(&v1_cpu).await.and_then(|s| parse_counter(&s)) {
        Some(ns) => ns,
        None => read_to_string(&v2_dir.join("cpu.stat"))
            .await
            .and_then(|s| parse_cpu_stat_usec(&s))
            .map(|usec| usec.saturating_mul(1000))
            .unwrap_or(0),
    };

    let memory_bytes = match read_to_string(&v1_mem).await.and_then(|s| parse_counter(&s)) {
        Some(bytes) => bytes,
        None => read_to_string(&v2_dir.join("memory.current"))
            .await
            .and_then(|s| parse_counter(&s))
            .unwrap_or(0),
    };

    Counters {
        cpu_ns,
        memory_bytes,
    }
}

async fn read_to_string(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::trace!(path = %path.display(), error = %e, "cgroup counter unavailable");
            None
        }
    }
}

fn parse_counter(text: &str) -> Option<u64> {
    text.trim().parse().ok()
}

fn parse_cpu_stat_usec(text: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(' ')?;
        if key == "usage_usec" {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
