//! Deterministic bind-port assignment
//!
//! A local port is mapped to a relay port by prefixing it with the rule
//! set's digit: `22` under prefix `3` becomes `30022`, `8080` becomes
//! `38080`. Ports with five digits cannot be prefixed and are left to the
//! registration backend to pick.

/// Result of a bind-port assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindPort {
    /// Deterministic relay port
    Fixed(u16),
    /// Let the registration backend choose a free port
    Random,
}

impl BindPort {
    pub fn fixed(self) -> Option<u16> {
        match self {
            BindPort::Fixed(port) => Some(port),
            BindPort::Random => None,
        }
    }
}

/// Assign a bind port for `local_port` under `prefix`
pub fn assign(local_port: u16, prefix: u8) -> BindPort {
    if local_port >= 10_000 {
        return BindPort::Random;
    }

    // prefix followed by the port zero-padded to four digits
    let candidate = u32::from(prefix) * 10_000 + u32::from(local_port);
    match u16::try_from(candidate) {
        Ok(port) if port > 0 => BindPort::Fixed(port),
        _ => BindPort::Random,
    }
}

/// Display/behavior hint: everything except SSH is a clickable link
pub fn link_value(local_port: u16) -> bool {
    local_port != 22
}
