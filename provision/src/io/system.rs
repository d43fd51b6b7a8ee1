//! Device-level operations: restart, watchdog, identity.

/// Whole-device services outside the radio.
pub trait System: Send {
    /// Request a device restart. On hardware this does not return; hosts
    /// record the request and let the calling loop unwind.
    fn restart(&mut self);
    fn feed_watchdog(&mut self);
    /// Six lowercase hex digits derived from the MAC, used in hostnames.
    fn device_suffix(&self) -> String;
    /// Chip family reported over the Improv device-info RPC.
    fn chip_family(&self) -> String;
}
