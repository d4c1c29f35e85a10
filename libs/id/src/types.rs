//! Typed ID definitions.

use crate::{define_id, define_key};

// =============================================================================
// Store-assigned
// =============================================================================

define_key!(
    /// Identifier of a desired agent record, assigned by the state store.
    ///
    /// Stable across reconciliation ticks; doubles as the worker ID.
    AgentId
);

// =============================================================================
// Runtime
// =============================================================================

define_id!(
    /// Identifier of one reconciliation tick, used to correlate log lines.
    TickId,
    "tick"
);

define_id!(
    /// Identifier of one worker boot. A worker recreated after a dirty
    /// reset gets a new boot ID under the same agent ID.
    BootId,
    "boot"
);
