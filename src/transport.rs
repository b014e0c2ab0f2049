//! Broadcast transport interface.
//!
//! The lock protocol relies on an external reliable broadcast service with
//! these delivery guarantees, which implementations must provide:
//!
//! - total order: every member observes all messages in one order;
//! - reliable atomic delivery to all live members, the sender included;
//! - membership-change events ordered consistently with regular messages
//!   on every member.
//!
//! The deterministic-apply scheme for unowned resources is correct only
//! under these guarantees.

use crate::error::Result;
use crate::proto::Message;

/// Send side of the group broadcast transport.
pub trait Broadcast: Send + Sync {
    /// Queue one message for totally ordered delivery to every member.
    fn send(&self, msg: &Message) -> Result<()>;

    /// True while the transport's send queue is over its high-water mark.
    ///
    /// While flow controlled the daemon stops reading new kernel requests
    /// (which may trigger broadcasts); delivered messages and local-only
    /// operations are unaffected.
    fn flow_controlled(&self) -> bool {
        false
    }
}
