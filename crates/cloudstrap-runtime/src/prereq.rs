use std::fmt;
use std::process::Command;

/// A missing host tool with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

const LXC_TOOLS: &[(&str, &str)] = &[
    ("lxc-create", "create the bootstrap container"),
    ("lxc-start", "start the bootstrap container"),
    ("lxc-wait", "wait for the container to reach RUNNING"),
    ("lxc-info", "discover the container address"),
];

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check host tools needed by the LXC runtime.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_lxc_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    for &(tool, purpose) in LXC_TOOLS {
        if !command_exists(tool) {
            missing.push(MissingPrereq {
                name: tool,
                purpose,
                install_hint: "apt install lxc",
            });
        }
    }

    if !command_exists("ssh") {
        missing.push(MissingPrereq {
            name: "ssh",
            purpose: "run commands inside the container",
            install_hint: "apt install openssh-client",
        });
    }

    if !command_exists("ssh-keygen") {
        missing.push(MissingPrereq {
            name: "ssh-keygen",
            purpose: "generate the operator key injected into the container",
            install_hint: "apt install openssh-client",
        });
    }

    missing
}

pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut out = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(out, "{m}");
    }
    out.push_str("\nThe installer provisions an LXC container; install the tools above and retry.");
    out
}
