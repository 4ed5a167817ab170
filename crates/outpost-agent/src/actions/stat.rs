//! File metadata lookup.

use std::fs;
use std::os::unix::fs::MetadataExt;

use anyhow::Context as _;
use outpost_core::wire::{MessageType, StatEntry, StatRequest};

use crate::context::ActionContext;
use crate::dispatcher::ClientAction;

/// Returns `lstat` metadata for one path.
pub struct StatFile;

impl ClientAction for StatFile {
    fn name(&self) -> &'static str {
        "StatFile"
    }

    fn handle(&self, ctx: &mut ActionContext) -> anyhow::Result<()> {
        let Some(request) = ctx.populate_args::<StatRequest>() else {
            return Ok(());
        };

        // Symlinks are reported, not followed.
        let metadata = fs::symlink_metadata(&request.path)
            .with_context(|| format!("stat of {}", request.path))?;

        let entry = StatEntry {
            st_mode: metadata.mode(),
            st_size: metadata.size(),
            st_mtime_s: metadata.mtime(),
            st_atime_s: metadata.atime(),
            st_ctime_s: metadata.ctime(),
            st_uid: metadata.uid(),
            st_gid: metadata.gid(),
        };
        ctx.send_response(&entry, MessageType::Message);
        Ok(())
    }
}
