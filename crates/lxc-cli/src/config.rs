/// A titled group of `key = value` lines appended to a container's config
/// file. Later assignments of a single-valued key override earlier ones,
/// list keys (`lxc.mount.entry`, `lxc.cgroup.devices.allow`) accumulate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlock {
    title: String,
    entries: Vec<(String, String)>,
}

impl ConfigBlock {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            entries: Vec::new(),
        }
    }

    pub fn entry(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.entries.push((key.into(), value.to_string()));
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn render(&self) -> String {
        let mut out = format!("\n# vpsbox: {}\n", self.title);
        for (key, value) in &self.entries {
            // An empty value clears list keys such as lxc.cap.drop.
            if value.is_empty() {
                out.push_str(&format!("{key} =\n"));
            } else {
                out.push_str(&format!("{key} = {value}\n"));
            }
        }
        out
    }
}
