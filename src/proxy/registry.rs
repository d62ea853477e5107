use dashmap::DashMap;
use log::debug;
use std::io;
use std::net::{Shutdown, TcpStream};

/// Negotiated connections keyed by the digest their client sent.
///
/// Entries stay registered until [`close_all`](Self::close_all). Lookups hand
/// out duplicated descriptors of the same socket, so shutting down any of
/// them ends the session for every holder.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, TcpStream>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `stream` under `digest`. A repeated digest replaces the
    /// earlier connection.
    pub fn put(&self, digest: impl Into<String>, stream: TcpStream) {
        let digest = digest.into();
        if let Some(previous) = self.connections.insert(digest.clone(), stream) {
            debug!(
                "Digest '{}' re-registered, dropping connection from {:?}",
                digest,
                previous.peer_addr().ok()
            );
        }
    }

    pub fn get(&self, digest: &str) -> io::Result<Option<TcpStream>> {
        self.connections
            .get(digest)
            .map(|entry| entry.value().try_clone())
            .transpose()
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.connections.contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn digests(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Shut down every registered connection and forget it. Returns how many
    /// sessions were released.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for digest in self.digests() {
            if let Some((digest, stream)) = self.connections.remove(&digest) {
                if let Err(e) = stream.shutdown(Shutdown::Both) {
                    debug!("Session '{}' was already closed: {}", digest, e);
                }
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn connected_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_get_returns_handle_to_same_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut client, server) = connected_pair(&listener);

        let registry = ConnectionRegistry::new();
        registry.put("abcd", server);

        let mut handle = registry.get("abcd").unwrap().unwrap();
        handle.write_all(b"ping").unwrap();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        // the entry survives the lookup
        assert!(registry.get("abcd").unwrap().is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_digest_is_absent() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("missing").unwrap().is_none());
        assert!(!registry.contains("missing"));
    }

    #[test]
    fn test_repeated_digest_last_write_wins() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (_first_client, first_server) = connected_pair(&listener);
        let (second_client, second_server) = connected_pair(&listener);

        let registry = ConnectionRegistry::new();
        registry.put("same", first_server);
        registry.put("same", second_server);

        assert_eq!(registry.len(), 1);
        let handle = registry.get("same").unwrap().unwrap();
        assert_eq!(
            handle.peer_addr().unwrap(),
            second_client.local_addr().unwrap()
        );
    }

    #[test]
    fn test_close_all_shuts_down_sessions() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut client, server) = connected_pair(&listener);

        let registry = ConnectionRegistry::new();
        registry.put("abcd", server);

        assert_eq!(registry.close_all(), 1);
        assert!(registry.is_empty());

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_digests_lists_every_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (_c1, s1) = connected_pair(&listener);
        let (_c2, s2) = connected_pair(&listener);

        let registry = ConnectionRegistry::new();
        registry.put("one", s1);
        registry.put(String::from("two"), s2);

        let mut digests = registry.digests();
        digests.sort();
        assert_eq!(digests, vec!["one".to_string(), "two".to_string()]);
    }
}
