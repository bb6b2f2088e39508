use bitflags::bitflags;

bitflags! {
    /// Capability bits a client requests when opening a device connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const RENDERING = 1 << 0;
        const DISPLAY = 1 << 1;
    }
}

impl Capabilities {
    /// A connection request must ask for at least one known capability and
    /// nothing else.
    pub fn validate(raw: u32) -> Option<Self> {
        let caps = Capabilities::from_bits(raw)?;
        if caps.is_empty() {
            return None;
        }
        Some(caps)
    }
}
