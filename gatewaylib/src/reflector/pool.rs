//! Dynamic handler pool (`spec.md` §4.4), grounded on
//! `original_source/DCSProtocolHandlerPool.cpp`: allocate a handler on
//! the first free local port, round-robin `read()` across the pool
//! retaining a cursor so the matching `readXxx()` lands on the right
//! handler, and isolate a single handler's failure from the rest.

use std::collections::BTreeMap;

use super::{Kind, ReflectorHandler};
use crate::error::GatewayError;

type Opener = Box<dyn Fn(&str, u16) -> Result<Box<dyn ReflectorHandler + Send>, GatewayError> + Send>;

pub struct HandlerPool {
    bind_addr: String,
    base_port: u16,
    opener: Opener,
    handlers: BTreeMap<u16, Box<dyn ReflectorHandler + Send>>,
    cursor: Option<u16>,
}

impl HandlerPool {
    pub fn new<F>(bind_addr: impl Into<String>, base_port: u16, opener: F) -> HandlerPool
    where
        F: Fn(&str, u16) -> Result<Box<dyn ReflectorHandler + Send>, GatewayError> + Send + 'static,
    {
        HandlerPool {
            bind_addr: bind_addr.into(),
            base_port,
            opener: Box::new(opener),
            handlers: BTreeMap::new(),
            cursor: None,
        }
    }

    /// Opens a new UDP socket on the first free local port starting at
    /// `base_port` and adds it to the pool. Never returns a handler
    /// already in the pool (an already-used port is always skipped).
    pub fn acquire(&mut self) -> Result<u16, GatewayError> {
        let mut port = self.base_port;
        while self.handlers.contains_key(&port) {
            port += 1;
        }
        let handler = (self.opener)(&self.bind_addr, port)?;
        let bound_port = handler.local_port();
        self.handlers.insert(bound_port, handler);
        Ok(bound_port)
    }

    /// Closes and removes the handler at `port`, if present.
    pub fn release(&mut self, port: u16) {
        if let Some(handler) = self.handlers.remove(&port) {
            handler.close();
        }
        if self.cursor == Some(port) {
            self.cursor = None;
        }
    }

    pub fn get_mut(&mut self, port: u16) -> Option<&mut (dyn ReflectorHandler + Send + '_)> {
        self.handlers.get_mut(&port).map(|b| b.as_mut() as &mut (dyn ReflectorHandler + Send))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.handlers.keys().copied().collect()
    }

    /// Round-robin scan starting just after the cursor. Leaves the
    /// cursor on the handler that returned a non-`None` kind so a
    /// following `readXxx()` call reads from it; if the scan wraps
    /// without a hit, returns `None` and leaves the cursor untouched.
    pub fn read(&mut self) -> Result<Option<(u16, Kind)>, GatewayError> {
        let ports = self.ports();
        if ports.is_empty() {
            return Ok(None);
        }
        let start_idx = match self.cursor {
            Some(p) => ports.iter().position(|&x| x == p).map(|i| (i + 1) % ports.len()).unwrap_or(0),
            None => 0,
        };
        for i in 0..ports.len() {
            let port = ports[(start_idx + i) % ports.len()];
            let handler = self.handlers.get_mut(&port).expect("port came from ports()");
            match handler.read() {
                Ok(Kind::None) => continue,
                Ok(kind) => {
                    self.cursor = Some(port);
                    return Ok(Some((port, kind)));
                }
                // A single handler's socket error must not bring down the pool;
                // drop it from rotation this cycle and keep scanning the rest.
                Err(_) => continue,
            }
        }
        Ok(None)
    }

    pub fn close(&mut self) {
        for (_, handler) in std::mem::take(&mut self.handlers) {
            handler.close();
        }
        self.cursor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflector::DExtraHandler;

    fn test_pool() -> HandlerPool {
        HandlerPool::new("127.0.0.1", 30100, |addr, port| {
            DExtraHandler::open(addr, port).map(|h| Box::new(h) as Box<dyn ReflectorHandler + Send>)
        })
    }

    #[test]
    fn acquire_never_reuses_a_port() {
        let mut pool = test_pool();
        let p1 = pool.acquire().unwrap();
        let p2 = pool.acquire().unwrap();
        assert_ne!(p1, p2);
        let ports = pool.ports();
        let mut unique = ports.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(ports.len(), unique.len());
    }

    #[test]
    fn release_frees_the_port_for_reuse() {
        let mut pool = test_pool();
        let p1 = pool.acquire().unwrap();
        pool.release(p1);
        assert!(pool.is_empty());
    }

    #[test]
    fn empty_pool_read_returns_none() {
        let mut pool = test_pool();
        assert!(pool.read().unwrap().is_none());
    }
}
