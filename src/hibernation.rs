//! Suspend/restore snapshot (§4.6, §9 **[ADDED]**).
//!
//! The host may suspend the process between frames and later revive it;
//! the only state that must survive is the agent connection's identity and
//! which WebSocket streams were open. HTTP streams are not restorable —
//! any in-flight exchange suspended mid-request is considered aborted with
//! `connectionLost` on resume (§4.6).

/// The minimal state a hibernating host must preserve across a suspend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connection_id: u64,
    pub open_ws_stream_ids: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_plain_comparable_data() {
        let a = SessionSnapshot {
            connection_id: 7,
            open_ws_stream_ids: vec![1, 3],
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
