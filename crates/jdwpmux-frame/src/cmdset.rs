//! JDWP command set and command constants.
//!
//! Only the commands this crate builds or inspects are listed. The DDMS
//! command set is Android's vendor extension carrying chunk traffic.

/// Flag bit set on reply packets.
pub const REPLY_FLAG: u8 = 0x80;

/// VirtualMachine command set.
pub const VM: u8 = 1;
/// VirtualMachine.Version
pub const VM_VERSION: u8 = 1;
/// VirtualMachine.IDSizes
pub const VM_ID_SIZES: u8 = 7;
/// VirtualMachine.Resume
pub const VM_RESUME: u8 = 9;
/// VirtualMachine.Exit
pub const VM_EXIT: u8 = 10;

/// Event command set.
pub const EVENT: u8 = 64;
/// Event.Composite
pub const EVENT_COMPOSITE: u8 = 100;

/// DDMS (Android extension) command set.
pub const DDMS: u8 = 0xC7;
/// The single DDMS command carrying chunks.
pub const DDMS_CHUNK: u8 = 0x01;

/// First id handed out by a client session.
///
/// Keeps host-allocated ids out of the range a debugger typically starts at.
pub const FIRST_CLIENT_PACKET_ID: u32 = 0x4000_0000;

/// Returns a human-readable name for a command set.
pub fn command_set_name(cmd_set: u8) -> &'static str {
    match cmd_set {
        VM => "VirtualMachine",
        2 => "ReferenceType",
        3 => "ClassType",
        4 => "ArrayType",
        5 => "InterfaceType",
        6 => "Method",
        8 => "Field",
        9 => "ObjectReference",
        10 => "StringReference",
        11 => "ThreadReference",
        12 => "ThreadGroupReference",
        13 => "ArrayReference",
        14 => "ClassLoaderReference",
        15 => "EventRequest",
        16 => "StackFrame",
        17 => "ClassObjectReference",
        EVENT => "Event",
        DDMS => "DDMS",
        _ => "UNKNOWN",
    }
}

/// Returns true for the command set/command pair carrying DDMS chunks.
pub fn is_ddms(cmd_set: u8, cmd: u8) -> bool {
    cmd_set == DDMS && cmd == DDMS_CHUNK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(command_set_name(VM), "VirtualMachine");
        assert_eq!(command_set_name(EVENT), "Event");
        assert_eq!(command_set_name(DDMS), "DDMS");
        assert_eq!(command_set_name(99), "UNKNOWN");
    }

    #[test]
    fn ddms_sentinel() {
        assert!(is_ddms(0xC7, 0x01));
        assert!(!is_ddms(0xC7, 0x02));
        assert!(!is_ddms(VM, VM_EXIT));
    }
}
