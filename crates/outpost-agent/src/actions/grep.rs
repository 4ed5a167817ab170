//! Literal search over a file.

use std::fs;

use anyhow::Context as _;
use outpost_core::wire::{BufferReference, GrepSpec, MessageType};

use crate::context::ActionContext;
use crate::dispatcher::ClientAction;

/// Emits one `BufferReference` per literal hit, with the requested
/// context window around each match.
pub struct Grep;

impl ClientAction for Grep {
    fn name(&self) -> &'static str {
        "Grep"
    }

    fn handle(&self, ctx: &mut ActionContext) -> anyhow::Result<()> {
        let Some(spec) = ctx.populate_args::<GrepSpec>() else {
            return Ok(());
        };
        if spec.literal.is_empty() {
            ctx.set_error("Grep spec contains no literal.");
            return Ok(());
        }

        let data = fs::read(&spec.path).with_context(|| format!("reading {}", spec.path))?;

        for hit in find_all(&data, &spec.literal) {
            let start = hit.saturating_sub(spec.bytes_before as usize);
            let end = (hit + spec.literal.len() + spec.bytes_after as usize).min(data.len());
            let reference = BufferReference {
                offset: start as u64,
                length: (end - start) as u64,
                data: data[start..end].to_vec(),
            };
            ctx.send_response(&reference, MessageType::Message);
        }
        Ok(())
    }
}

/// Offsets of every (possibly overlapping) occurrence of `needle`.
fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    let mut hits = Vec::new();
    if needle.is_empty() || haystack.len() < needle.len() {
        return hits;
    }
    for offset in 0..=haystack.len() - needle.len() {
        if &haystack[offset..offset + needle.len()] == needle {
            hits.push(offset);
        }
    }
    hits
}
