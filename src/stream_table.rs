//! Stream table (§4.2): per-session registry of in-flight HTTP and
//! WebSocket streams, plus `streamId` allocation.
//!
//! Two maps keyed by `streamId`, never sharing a key (§3 invariant 2). A
//! single monotonic counter hands out ids; ids are never recycled within a
//! `connectionId` (§3 invariant 1). All access is expected to happen while
//! the caller holds the session's state lock (§5) — this type is plain data,
//! not synchronized on its own.

use std::collections::{HashMap, HashSet};

use crate::http_stream::HttpStreamSlot;
use crate::ws_stream::WsStreamSlot;

#[derive(Default)]
pub struct StreamTable {
    next_stream_id: u32,
    http: HashMap<u32, HttpStreamSlot>,
    ws: HashMap<u32, WsStreamSlot>,
    /// `streamId`s whose HTTP exchange ended via `responseEnd`/`responseAbort`
    /// (§4.3: "any frame after `responseEnd` or `responseAbort` is a
    /// `protocolError`"). Ids removed for other reasons (deadline, agent
    /// disconnect, promotion) are never added here, so a late frame for
    /// those stays a silent drop per §4.3/§8's deadline boundary case.
    terminated_http: HashSet<u32>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            next_stream_id: 1,
            http: HashMap::new(),
            ws: HashMap::new(),
            terminated_http: HashSet::new(),
        }
    }

    /// Reset allocation and drop every entry — called on agent reconnect
    /// once in-flight streams have been failed (§3: "Agent socket" attach).
    pub fn reset(&mut self) {
        self.next_stream_id = 1;
        self.http.clear();
        self.ws.clear();
        self.terminated_http.clear();
    }

    /// Mark `stream_id` as having reached its terminal HTTP frame, so a
    /// later frame for the same id is rejected instead of silently dropped.
    pub fn mark_http_terminated(&mut self, stream_id: u32) {
        self.terminated_http.insert(stream_id);
    }

    pub fn is_http_terminated(&self, stream_id: u32) -> bool {
        self.terminated_http.contains(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.http.len() + self.ws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand out the next `streamId` and advance the counter (§4.2).
    pub fn allocate_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(1);
        id
    }

    pub fn insert_http(&mut self, stream_id: u32, slot: HttpStreamSlot) {
        self.http.insert(stream_id, slot);
    }

    pub fn http(&self, stream_id: u32) -> Option<&HttpStreamSlot> {
        self.http.get(&stream_id)
    }

    pub fn http_mut(&mut self, stream_id: u32) -> Option<&mut HttpStreamSlot> {
        self.http.get_mut(&stream_id)
    }

    /// Remove an HTTP slot, aborting its deadline watcher (§4.2: "clears any
    /// pending deadline").
    pub fn remove_http(&mut self, stream_id: u32) -> Option<HttpStreamSlot> {
        let slot = self.http.remove(&stream_id);
        if let Some(slot) = &slot {
            slot.deadline.abort();
        }
        slot
    }

    /// Move an HTTP slot into the WebSocket map under the same id (§4.4
    /// promotion). Panics if `stream_id` is not present in the HTTP map —
    /// callers only invoke this from the `responseInit{101}` path, which
    /// already holds a valid HTTP entry.
    pub fn promote_to_ws(&mut self, stream_id: u32, slot: WsStreamSlot) {
        self.http.remove(&stream_id);
        self.ws.insert(stream_id, slot);
    }

    pub fn ws(&self, stream_id: u32) -> Option<&WsStreamSlot> {
        self.ws.get(&stream_id)
    }

    pub fn ws_mut(&mut self, stream_id: u32) -> Option<&mut WsStreamSlot> {
        self.ws.get_mut(&stream_id)
    }

    pub fn remove_ws(&mut self, stream_id: u32) -> Option<WsStreamSlot> {
        self.ws.remove(&stream_id)
    }

    pub fn ws_stream_ids(&self) -> Vec<u32> {
        self.ws.keys().copied().collect()
    }

    pub fn drain_http(&mut self) -> Vec<(u32, HttpStreamSlot)> {
        self.http.drain().collect()
    }

    pub fn drain_ws(&mut self) -> Vec<(u32, WsStreamSlot)> {
        self.ws.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_abort_handle() -> tokio::task::AbortHandle {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async { tokio::spawn(async { std::future::pending::<()>().await }).abort_handle() })
    }

    #[test]
    fn ids_never_repeat() {
        let mut table = StreamTable::new();
        let a = table.allocate_id();
        let b = table.allocate_id();
        let c = table.allocate_id();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn reset_restarts_allocation_and_clears_maps() {
        let mut table = StreamTable::new();
        let (slot, _headers_rx) = HttpStreamSlot::new(dummy_abort_handle());
        table.insert_http(table.allocate_id(), slot);
        assert_eq!(table.len(), 1);
        table.reset();
        assert_eq!(table.len(), 0);
        assert_eq!(table.allocate_id(), 1);
    }

    #[test]
    fn reset_forgets_terminated_ids_too() {
        let mut table = StreamTable::new();
        table.mark_http_terminated(7);
        assert!(table.is_http_terminated(7));
        table.reset();
        assert!(!table.is_http_terminated(7));
    }

    #[test]
    fn http_and_ws_never_share_a_slot() {
        let mut table = StreamTable::new();
        let id = table.allocate_id();
        let (slot, _headers_rx) = HttpStreamSlot::new(dummy_abort_handle());
        table.insert_http(id, slot);
        assert!(table.http(id).is_some());
        table.promote_to_ws(id, WsStreamSlot::new_for_test());
        assert!(table.http(id).is_none());
        assert!(table.ws(id).is_some());
    }
}
