//! Static client description.

use outpost_core::wire::{ClientInformation, MessageType};

use crate::context::ActionContext;
use crate::dispatcher::ClientAction;

/// Reports the client name and version.
pub struct GetClientInfo;

impl ClientAction for GetClientInfo {
    fn name(&self) -> &'static str {
        "GetClientInfo"
    }

    fn handle(&self, ctx: &mut ActionContext) -> anyhow::Result<()> {
        let info = ClientInformation {
            client_name: "outpost".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            build_time: String::new(),
        };
        ctx.send_response(&info, MessageType::Message);
        Ok(())
    }
}
