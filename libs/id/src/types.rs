//! Opaque resource-manager ID definitions.
//!
//! The master mints these; the scheduler never generates them.

use crate::define_id;

// =============================================================================
// Resource Manager
// =============================================================================

define_id!(FrameworkId, "framework ID");
define_id!(OfferId, "offer ID");
define_id!(AgentId, "agent ID");
define_id!(ExecutorId, "executor ID");

// =============================================================================
// Tests
// =============================================================================
