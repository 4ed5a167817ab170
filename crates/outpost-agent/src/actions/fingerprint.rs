//! File content fingerprinting.

use std::fs::File;
use std::io::Read;

use anyhow::Context as _;
use outpost_core::crypto::{hex_lower, Digest, DigestAlgorithm};
use outpost_core::wire::{FingerprintRequest, FingerprintResponse, MessageType};

use crate::context::ActionContext;
use crate::dispatcher::ClientAction;

/// Streams a file through MD5, SHA-1, and SHA-256 in one pass.
pub struct FingerprintFile;

impl ClientAction for FingerprintFile {
    fn name(&self) -> &'static str {
        "FingerprintFile"
    }

    fn handle(&self, ctx: &mut ActionContext) -> anyhow::Result<()> {
        let Some(request) = ctx.populate_args::<FingerprintRequest>() else {
            return Ok(());
        };

        let mut file =
            File::open(&request.path).with_context(|| format!("opening {}", request.path))?;

        let mut md5 = Digest::new(DigestAlgorithm::Md5)?;
        let mut sha1 = Digest::new(DigestAlgorithm::Sha1)?;
        let mut sha256 = Digest::new(DigestAlgorithm::Sha256)?;

        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            md5.update(&buffer[..read])?;
            sha1.update(&buffer[..read])?;
            sha256.update(&buffer[..read])?;
        }

        let response = FingerprintResponse {
            md5: hex_lower(&md5.finish()?),
            sha1: hex_lower(&sha1.finish()?),
            sha256: hex_lower(&sha256.finish()?),
        };
        ctx.send_response(&response, MessageType::Message);
        Ok(())
    }
}
