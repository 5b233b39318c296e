//! Topic constants for PUB/SUB routing.

// ── Notification feed (hub PUB) ───────────────────────────────────────────

/// An engine answered its first heartbeat and is ready for work.
pub const REGISTRATION_NOTIFICATION: &str = "registration_notification";

/// An engine unregistered or was declared dead.
pub const UNREGISTRATION_NOTIFICATION: &str = "unregistration_notification";

// ── Monitor feed (hub SUB) ────────────────────────────────────────────────

/// Client request entering the mux relay.
pub const MUX_IN: &str = "in";

/// Engine reply leaving the mux relay.
pub const MUX_OUT: &str = "out";

pub const CONTROL_IN: &str = "incontrol";

pub const CONTROL_OUT: &str = "outcontrol";

/// Task submitted to the task scheduler.
pub const TASK_IN: &str = "intask";

/// Task reply leaving the task scheduler.
pub const TASK_OUT: &str = "outtask";

/// Task assigned to an engine.
pub const TASK_TRACK: &str = "tracktask";

pub const IOPUB: &str = "iopub";

pub const BROADCAST_IN: &str = "inbcast";

pub const BROADCAST_OUT: &str = "outbcast";
