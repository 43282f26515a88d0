use std::{collections::HashSet, net::TcpListener};

use crate::error::{DeployError, DeployResult};

const MAX_ATTEMPTS: usize = 32;

/// Pick a local TCP port for an app's upstream.
///
/// An app keeps `preferred` (its existing port) across redeploys. Otherwise the
/// OS picks one, skipping ports already assigned to other apps.
pub fn allocate_tcp_port(preferred: Option<u16>, taken: &HashSet<u16>) -> DeployResult<u16> {
    if let Some(port) = preferred.filter(|p| *p != 0) {
        return Ok(port);
    }

    for _ in 0..MAX_ATTEMPTS {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let port = listener.local_addr()?.port();
        if !taken.contains(&port) {
            return Ok(port);
        }
    }
    Err(DeployError::Registration(
        "could not find a free local port".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_preferred_port() {
        assert_eq!(allocate_tcp_port(Some(4100), &HashSet::new()).unwrap(), 4100);
    }

    #[test]
    fn fresh_port_avoids_taken_ones() {
        let first = allocate_tcp_port(None, &HashSet::new()).unwrap();
        let taken: HashSet<u16> = [first].into_iter().collect();
        let second = allocate_tcp_port(None, &taken).unwrap();
        assert_ne!(first, second);
        assert_ne!(second, 0);
    }
}
