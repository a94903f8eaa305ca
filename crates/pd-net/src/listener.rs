//! Listener that records every notification it receives.

use crate::request::RequestView;
use crate::request::StreamListener;
use pd_core::NetError;
use pd_core::NetStatus;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Start {
        pending: bool,
        status: NetStatus,
        content_type: Option<String>,
    },
    Data {
        offset: u64,
        bytes: Vec<u8>,
    },
    Stop(NetStatus),
}

#[derive(Debug, Default)]
struct Recording {
    events: Vec<ListenerEvent>,
    refuse_data: Option<NetError>,
}

/// Clones share one recording, so a test can keep a handle while the
/// channel owns the listener.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    recording: Rc<RefCell<Recording>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every further `on_data_available` fail with `error`.
    pub fn refuse_data(&self, error: NetError) {
        self.recording.borrow_mut().refuse_data = Some(error);
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.recording.borrow().events.clone()
    }

    pub fn starts(&self) -> usize {
        self.count(|event| matches!(event, ListenerEvent::Start { .. }))
    }

    pub fn stops(&self) -> usize {
        self.count(|event| matches!(event, ListenerEvent::Stop(_)))
    }

    pub fn last_stop(&self) -> Option<NetStatus> {
        self.recording
            .borrow()
            .events
            .iter()
            .rev()
            .find_map(|event| match event {
                ListenerEvent::Stop(status) => Some(*status),
                _ => None,
            })
    }

    /// Concatenation of all received data.
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for event in &self.recording.borrow().events {
            if let ListenerEvent::Data { bytes, .. } = event {
                body.extend_from_slice(bytes);
            }
        }
        body
    }

    fn count(&self, predicate: impl Fn(&ListenerEvent) -> bool) -> usize {
        self.recording
            .borrow()
            .events
            .iter()
            .filter(|event| predicate(event))
            .count()
    }
}

impl StreamListener for RecordingListener {
    fn on_start_request(&mut self, request: RequestView<'_>) -> NetStatus {
        self.recording.borrow_mut().events.push(ListenerEvent::Start {
            pending: request.pending,
            status: request.status,
            content_type: request.head.map(|head| head.content_type.clone()),
        });
        Ok(())
    }

    fn on_data_available(
        &mut self,
        _request: RequestView<'_>,
        data: &[u8],
        offset: u64,
    ) -> NetStatus {
        let mut recording = self.recording.borrow_mut();
        if let Some(error) = recording.refuse_data {
            return Err(error);
        }
        recording.events.push(ListenerEvent::Data {
            offset,
            bytes: data.to_vec(),
        });
        Ok(())
    }

    fn on_stop_request(&mut self, _request: RequestView<'_>, status: NetStatus) {
        self.recording
            .borrow_mut()
            .events
            .push(ListenerEvent::Stop(status));
    }
}
