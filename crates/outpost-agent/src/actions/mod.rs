//! Built-in client actions.
//!
//! Each action is a small, bounded introspection of the host, registered
//! by name with the dispatcher. Anything long-running or open-ended lives
//! in the helper subprocess instead.

mod fingerprint;
mod grep;
mod info;
mod stat;

pub use fingerprint::FingerprintFile;
pub use grep::Grep;
pub use info::GetClientInfo;
pub use stat::StatFile;

use crate::dispatcher::ClientAction;

/// The default action set.
#[must_use]
pub fn builtin_actions() -> Vec<Box<dyn ClientAction>> {
    vec![
        Box::new(GetClientInfo),
        Box::new(StatFile),
        Box::new(Grep),
        Box::new(FingerprintFile),
    ]
}
