//! The fixed "bouncer" executable substituted for `bin`/`bin-restrict`
//! backings (spec §4.4, GLOSSARY "Bouncer"). Opened once at mount and read
//! by every handler afterwards (spec §5 "Shared resources").

use std::path::Path;

use bedrock_core::error::CoreResult;

#[derive(Debug)]
pub struct Bouncer {
    bytes: Vec<u8>,
}

impl Bouncer {
    pub fn load(path: &Path) -> CoreResult<Bouncer> {
        let bytes = std::fs::read(path)?;
        Ok(Bouncer { bytes })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}
