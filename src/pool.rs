//! Idle connection pool, keyed by `(host, port)`.
//!
//! Buckets are LIFO: the most recently released socket is the
//! warmest. An entry is removed from its bucket before any read
//! callback can fire on it again, so a race with a peer close just
//! turns into a pool miss and a fresh connect.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::conn::TcpConn;

pub struct Pool {
    conns: HashMap<(String, u16), Vec<Rc<TcpConn>>>,
}

impl Pool {
    pub fn new() -> Pool {
        Pool { conns: HashMap::new() }
    }

    /// Pop an idle connection for `(host, port)`, discarding any that
    /// died while pooled. `None` means the caller should dial.
    pub fn checkout(&mut self, host: &str, port: u16)
        -> Option<Rc<TcpConn>>
    {
        let bucket = self.conns.get_mut(&(host.to_string(), port))?;
        while let Some(conn) = bucket.pop() {
            if conn.is_connected() {
                debug!("reusing idle connection to {}:{}", host, port);
                return Some(conn);
            }
            trace!("discarding dead pooled connection to {}:{}",
                host, port);
        }
        None
    }

    fn insert(&mut self, conn: Rc<TcpConn>) {
        let key = (conn.host().to_string(), conn.port());
        self.conns.entry(key).or_insert_with(Vec::new).push(conn);
    }

    fn remove(&mut self, conn: &Rc<TcpConn>) {
        let key = (conn.host().to_string(), conn.port());
        if let Some(bucket) = self.conns.get_mut(&key) {
            bucket.retain(|c| !Rc::ptr_eq(c, conn));
        }
    }

    #[cfg(test)]
    pub fn idle_count(&self, host: &str, port: u16) -> usize {
        self.conns
            .get(&(host.to_string(), port))
            .map(|b| b.len())
            .unwrap_or(0)
    }
}

/// Return an idle connection to the pool.
///
/// Installs a close callback that silently drops the entry when the
/// peer goes away, and a read callback that discards the connection
/// if the peer sends anything while it is idle.
pub fn release(pool: &Rc<RefCell<Pool>>, conn: Rc<TcpConn>) {
    if !conn.is_connected() {
        return;
    }
    trace!("pooling idle connection to {}:{}", conn.host(), conn.port());
    let weak_pool = Rc::downgrade(pool);
    let weak_conn = Rc::downgrade(&conn);
    let (wp, wc) = (weak_pool.clone(), weak_conn.clone());
    conn.set_callbacks(
        Box::new(move |data| {
            // Unexpected bytes on an idle connection: drop it.
            if let (Some(pool), Some(conn)) = (wp.upgrade(), wc.upgrade()) {
                debug!("{} stray bytes on idle connection to {}:{}",
                    data.len(), conn.host(), conn.port());
                pool.borrow_mut().remove(&conn);
                conn.close();
            }
        }),
        Box::new(move || {
            if let (Some(pool), Some(conn)) =
                (weak_pool.upgrade(), weak_conn.upgrade())
            {
                trace!("idle connection to {}:{} closed by peer",
                    conn.host(), conn.port());
                pool.borrow_mut().remove(&conn);
            }
        }),
        Box::new(|_| {}));
    pool.borrow_mut().insert(conn);
}
