use jdwpmux_frame::ddms::{ApnmEvent, HeloReply, WaitEvent};
use jdwpmux_session::ProxyStatus;
use serde::Serialize;

/// Names a VM reports before the process is fully initialized.
pub const EARLY_PROCESS_NAMES: [&str; 2] = ["<pre-initialized>", ""];

/// Names that never identify a real process.
pub const PLACEHOLDER_NAMES: [&str; 3] = ["", "<pre-initialized>", "<unknown>"];

pub fn is_placeholder_name(name: &str) -> bool {
    PLACEHOLDER_NAMES.contains(&name)
}

fn filter_fake_name(name: Option<&str>) -> Option<String> {
    name.filter(|name| !EARLY_PROCESS_NAMES.contains(name))
        .map(str::to_string)
}

/// What is known about one debuggable process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessProperties {
    pub pid: u32,
    pub process_name: Option<String>,
    pub user_id: Option<i32>,
    pub package_name: Option<String>,
    pub vm_identifier: Option<String>,
    pub abi: Option<String>,
    pub jvm_flags: Option<String>,
    pub is_native_debuggable: bool,
    pub features: Vec<String>,
    pub is_waiting_for_debugger: bool,
    pub wait_command_received: bool,
    /// Collection has finished, successfully or not.
    pub completed: bool,
    /// The unexpected error that ended collection, if any.
    pub exception: Option<String>,
    pub proxy_status: Option<ProxyStatus>,
}

impl ProcessProperties {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            ..Self::default()
        }
    }

    pub fn is_debugger_attached(&self) -> bool {
        self.proxy_status
            .as_ref()
            .is_some_and(ProxyStatus::is_attached)
    }

    pub(crate) fn apply_helo(&mut self, helo: &HeloReply) {
        self.process_name = filter_fake_name(Some(&helo.process_name));
        self.user_id = helo.user_id;
        self.package_name = filter_fake_name(helo.package_name.as_deref());
        self.vm_identifier = Some(helo.vm_identifier.clone());
        self.abi = helo.abi.clone();
        self.jvm_flags = helo.jvm_flags.clone();
        self.is_native_debuggable = helo.is_native_debuggable.unwrap_or(false);
    }

    pub(crate) fn apply_apnm(&mut self, apnm: &ApnmEvent) {
        self.process_name = filter_fake_name(Some(&apnm.process_name));
        self.user_id = apnm.user_id;
        self.package_name = filter_fake_name(apnm.package_name.as_deref());
    }

    pub(crate) fn apply_wait(&mut self, wait: &WaitEvent) {
        self.wait_command_received = true;
        self.is_waiting_for_debugger = wait.is_waiting_for_debugger();
    }

    /// Short form for log lines.
    pub fn summary(&self) -> String {
        format!(
            "pid={} name={} features={} completed={}",
            self.pid,
            self.process_name.as_deref().unwrap_or("?"),
            self.features.len(),
            self.completed
        )
    }
}
