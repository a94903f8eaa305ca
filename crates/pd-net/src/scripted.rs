//! In-memory transport that replays a fixed script of notifications.
//!
//! Used by the demo binary and by tests of the channel actors; the script
//! stands in for an HTTP or FTP transfer.

use crate::request::DataChunk;
use crate::request::NetworkRequest;
use crate::request::RedirectFlags;
use crate::request::RequestEvent;
use crate::request::RequestFactory;
use crate::url::ChannelUri;
use pd_core::NetError;
use pd_core::NetResult;
use pd_core::NetStatus;
use pd_ipc::OpenArgs;
use pd_ipc::RedirectRequest;
use pd_ipc::ResponseHead;
use pd_privacy::LoadContext;
use pd_privacy::OriginAttributes;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Start,
    Data(Vec<u8>),
    FailRead { count: usize, error: NetError },
    Redirect {
        redirect: RedirectRequest,
        flags: RedirectFlags,
    },
    Stop(NetStatus),
}

/// Notifications a [`ScriptedRequest`] replays once opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    content_type: String,
    open_error: Option<NetError>,
    steps: Vec<Step>,
}

impl Script {
    /// A response that starts with the given content type.
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            open_error: None,
            steps: vec![Step::Start],
        }
    }

    /// A response that asks to be redirected before it starts.
    pub fn redirect(redirect: RedirectRequest, flags: RedirectFlags) -> Self {
        Self {
            content_type: String::new(),
            open_error: None,
            steps: vec![Step::Redirect { redirect, flags }],
        }
    }

    /// A transport whose `async_open` fails.
    pub fn failing_open(error: NetError) -> Self {
        Self {
            content_type: String::new(),
            open_error: Some(error),
            steps: Vec::new(),
        }
    }

    pub fn data(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.steps.push(Step::Data(bytes.into()));
        self
    }

    pub fn fail_read(mut self, count: usize, error: NetError) -> Self {
        self.steps.push(Step::FailRead { count, error });
        self
    }

    pub fn stop(mut self, status: NetStatus) -> Self {
        self.steps.push(Step::Stop(status));
        self
    }

    fn content_length(&self) -> i64 {
        let mut total = 0_i64;
        for step in &self.steps {
            match step {
                Step::Data(bytes) => total += bytes.len() as i64,
                Step::FailRead { .. } => return -1,
                _ => {}
            }
        }
        total
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    suspends: usize,
    resumes: usize,
    cancels: Vec<NetError>,
}

/// Shared counters observing what a channel did to its transport.
#[derive(Debug, Clone, Default)]
pub struct RequestProbe {
    state: Rc<RefCell<ProbeState>>,
}

impl RequestProbe {
    pub fn suspends(&self) -> usize {
        self.state.borrow().suspends
    }

    pub fn resumes(&self) -> usize {
        self.state.borrow().resumes
    }

    /// Every status the request was cancelled with, including repeats.
    pub fn cancels(&self) -> Vec<NetError> {
        self.state.borrow().cancels.clone()
    }
}

/// Transport replaying a [`Script`].
#[derive(Debug)]
pub struct ScriptedRequest {
    uri: ChannelUri,
    channel_id: u64,
    head: ResponseHead,
    open_error: Option<NetError>,
    steps: VecDeque<Step>,
    opened: bool,
    started: bool,
    finished: bool,
    parked: bool,
    suspend_count: usize,
    forced_pending: bool,
    status: NetStatus,
    next_offset: u64,
    probe: RequestProbe,
}

impl ScriptedRequest {
    pub fn new(uri: ChannelUri, channel_id: u64, script: Script) -> Self {
        let head = ResponseHead::new(uri.as_str(), script.content_type.clone())
            .with_content_length(script.content_length());
        Self {
            uri,
            channel_id,
            head,
            open_error: script.open_error,
            steps: script.steps.into(),
            opened: false,
            started: false,
            finished: false,
            parked: false,
            suspend_count: 0,
            forced_pending: false,
            status: Ok(()),
            next_offset: 0,
            probe: RequestProbe::default(),
        }
    }

    pub fn probe(&self) -> RequestProbe {
        self.probe.clone()
    }

    fn transferring(&self) -> bool {
        self.opened && !self.finished
    }

    fn finish(&mut self, status: NetStatus) -> RequestEvent {
        self.finished = true;
        self.steps.clear();
        if self.status.is_ok() {
            self.status = status;
        }
        RequestEvent::Stop(self.status)
    }
}

impl NetworkRequest for ScriptedRequest {
    fn uri(&self) -> &ChannelUri {
        &self.uri
    }

    fn channel_id(&self) -> u64 {
        self.channel_id
    }

    fn async_open(&mut self) -> NetStatus {
        if self.opened {
            return Err(NetError::Unexpected);
        }
        if let Some(error) = self.open_error {
            self.status = Err(error);
            return Err(error);
        }
        self.opened = true;
        Ok(())
    }

    fn cancel(&mut self, status: NetError) {
        self.probe.state.borrow_mut().cancels.push(status);
        if self.finished {
            return;
        }
        debug!(uri = %self.uri.as_str(), status = %status, "scripted request cancelled");
        if self.status.is_ok() {
            self.status = Err(status);
        }
        self.parked = false;
        self.steps.clear();
        if !self.started {
            self.steps.push_back(Step::Start);
        }
        self.steps.push_back(Step::Stop(Err(status)));
    }

    fn suspend(&mut self) -> NetStatus {
        if !self.transferring() {
            return Err(NetError::NotAvailable);
        }
        self.suspend_count += 1;
        self.probe.state.borrow_mut().suspends += 1;
        Ok(())
    }

    fn resume(&mut self) -> NetStatus {
        if self.suspend_count == 0 {
            return Err(NetError::Unexpected);
        }
        self.suspend_count -= 1;
        self.probe.state.borrow_mut().resumes += 1;
        Ok(())
    }

    fn is_pending(&self) -> bool {
        self.forced_pending || self.transferring()
    }

    fn force_pending(&mut self, forced: bool) {
        self.forced_pending = forced;
    }

    fn status(&self) -> NetStatus {
        self.status
    }

    fn response_head(&self) -> Option<&ResponseHead> {
        self.started.then_some(&self.head)
    }

    fn poll_event(&mut self) -> Option<RequestEvent> {
        if !self.transferring() || self.suspend_count > 0 || self.parked {
            return None;
        }

        let Some(step) = self.steps.pop_front() else {
            return Some(self.finish(Ok(())));
        };

        let event = match step {
            Step::Start => {
                self.started = true;
                RequestEvent::Start
            }
            Step::Data(bytes) => {
                let offset = self.next_offset;
                self.next_offset += bytes.len() as u64;
                RequestEvent::Data(DataChunk::from_bytes(offset, bytes))
            }
            Step::FailRead { count, error } => {
                RequestEvent::Data(DataChunk::failing(self.next_offset, count, error))
            }
            Step::Redirect { redirect, flags } => {
                self.parked = true;
                debug!(
                    uri = %self.uri.as_str(),
                    target = %redirect.target_uri,
                    "scripted request redirecting"
                );
                RequestEvent::Redirect { redirect, flags }
            }
            Step::Stop(status) => self.finish(status),
        };
        Some(event)
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    scripts: HashMap<String, Script>,
    offline: bool,
    denied_hosts: Vec<String>,
    next_channel_id: u64,
    probes: Vec<(String, RequestProbe)>,
    contexts: Vec<Option<OriginAttributes>>,
}

/// Factory handing out [`ScriptedRequest`]s by URI.
///
/// Unknown URIs produce a transport whose open is refused.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFactory {
    state: Rc<RefCell<FactoryState>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, uri: &str, script: Script) {
        self.state
            .borrow_mut()
            .scripts
            .insert(uri.to_owned(), script);
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.borrow_mut().offline = offline;
    }

    pub fn deny_host(&self, host: &str) {
        self.state.borrow_mut().denied_hosts.push(host.to_owned());
    }

    /// Probe of the most recent request created for `uri`.
    pub fn probe(&self, uri: &str) -> Option<RequestProbe> {
        self.state
            .borrow()
            .probes
            .iter()
            .rev()
            .find(|(candidate, _)| candidate == uri)
            .map(|(_, probe)| probe.clone())
    }

    /// Origin attributes of every request created so far, in order.
    pub fn contexts(&self) -> Vec<Option<OriginAttributes>> {
        self.state.borrow().contexts.clone()
    }
}

impl RequestFactory for ScriptedFactory {
    fn create(
        &self,
        args: &OpenArgs,
        context: Option<&LoadContext>,
    ) -> NetResult<Box<dyn NetworkRequest>> {
        let uri = ChannelUri::parse(&args.uri).map_err(|_| NetError::MalformedUri)?;

        let mut state = self.state.borrow_mut();
        if state.offline {
            return Err(NetError::Offline);
        }
        if state.denied_hosts.iter().any(|host| host == uri.host()) {
            return Err(NetError::PermissionDenied);
        }

        let script = state
            .scripts
            .get(uri.as_str())
            .cloned()
            .unwrap_or_else(|| Script::failing_open(NetError::ConnectionRefused));

        let channel_id = if args.channel_id != 0 {
            args.channel_id
        } else {
            state.next_channel_id += 1;
            state.next_channel_id
        };

        let request = ScriptedRequest::new(uri, channel_id, script);
        state
            .probes
            .push((request.uri().as_str().to_owned(), request.probe()));
        state
            .contexts
            .push(context.map(LoadContext::origin_attributes));
        Ok(Box::new(request))
    }
}

#[cfg(test)]
mod tests {
    use super::Script;
    use super::ScriptedFactory;
    use super::ScriptedRequest;
    use crate::request::NetworkRequest;
    use crate::request::RedirectFlags;
    use crate::request::RequestEvent;
    use crate::request::RequestFactory;
    use crate::url::ChannelUri;
    use pd_core::NetError;
    use pd_ipc::OpenArgs;
    use pd_ipc::RedirectRequest;

    fn request(script: Script) -> ScriptedRequest {
        let uri = ChannelUri::parse("ftp://files.example.org/pub/readme.txt");
        ScriptedRequest::new(uri.unwrap_or_else(|_| unreachable!()), 1, script)
    }

    fn drain(request: &mut ScriptedRequest) -> Vec<String> {
        let mut seen = Vec::new();
        while let Some(event) = request.poll_event() {
            seen.push(match event {
                RequestEvent::Start => "start".to_owned(),
                RequestEvent::Data(chunk) => format!("data@{}+{}", chunk.offset, chunk.count),
                RequestEvent::Stop(status) => format!("stop:{status:?}"),
                RequestEvent::Redirect { redirect, .. } => format!("redirect:{}", redirect.target_uri),
            });
        }
        seen
    }

    #[test]
    fn replays_script_after_open() {
        let mut request = request(Script::new("text/plain").data("abc").data("de").stop(Ok(())));
        assert!(request.poll_event().is_none());
        assert!(!request.is_pending());
        assert_eq!(request.async_open(), Ok(()));
        assert!(request.is_pending());
        assert_eq!(
            drain(&mut request),
            ["start", "data@0+3", "data@3+2", "stop:Ok(())"]
        );
        assert!(!request.is_pending());
        let head = request.response_head().map(|head| head.content_length);
        assert_eq!(head, Some(5));
    }

    #[test]
    fn suspend_holds_events_and_fails_after_completion() {
        let mut request = request(Script::new("text/plain").data("abc").stop(Ok(())));
        assert_eq!(request.async_open(), Ok(()));
        assert_eq!(request.suspend(), Ok(()));
        assert!(request.poll_event().is_none());
        assert_eq!(request.resume(), Ok(()));
        assert_eq!(request.resume(), Err(NetError::Unexpected));
        drain(&mut request);
        assert_eq!(request.suspend(), Err(NetError::NotAvailable));
        assert_eq!(request.probe().suspends(), 1);
        assert_eq!(request.probe().resumes(), 1);
    }

    #[test]
    fn cancel_before_start_still_reports_start_and_stop() {
        let mut request = request(Script::new("text/plain").data("abc").stop(Ok(())));
        assert_eq!(request.async_open(), Ok(()));
        request.cancel(NetError::Aborted);
        request.cancel(NetError::NetReset);
        assert_eq!(request.status(), Err(NetError::Aborted));
        assert_eq!(drain(&mut request), ["start", "stop:Err(Aborted)"]);
        assert_eq!(
            request.probe().cancels(),
            [NetError::Aborted, NetError::NetReset]
        );
    }

    #[test]
    fn forced_pending_only_affects_pendency() {
        let mut request = request(Script::new("text/plain").stop(Ok(())));
        assert_eq!(request.async_open(), Ok(()));
        drain(&mut request);
        request.force_pending(true);
        assert!(request.is_pending());
        assert_eq!(request.suspend(), Err(NetError::NotAvailable));
        assert!(request.poll_event().is_none());
    }

    #[test]
    fn redirect_parks_until_cancelled() {
        let redirect = RedirectRequest {
            target_uri: "https://mirror.example.org/readme.txt".to_owned(),
            new_load_flags: 0,
            load_info: Vec::new(),
            channel_id: 1,
            original_uri: "ftp://files.example.org/pub/readme.txt".to_owned(),
            completion_identifier: 0,
        };
        let mut request = request(Script::redirect(redirect, RedirectFlags::TEMPORARY));
        assert_eq!(request.async_open(), Ok(()));
        assert_eq!(
            drain(&mut request),
            ["redirect:https://mirror.example.org/readme.txt"]
        );
        request.cancel(NetError::Redirected);
        assert_eq!(drain(&mut request), ["start", "stop:Err(Redirected)"]);
    }

    #[test]
    fn factory_refuses_offline_denied_and_malformed() {
        let factory = ScriptedFactory::new();
        factory.serve("https://example.org/", Script::new("text/html").stop(Ok(())));
        let args = OpenArgs::get("https://example.org/");
        assert!(factory.create(&args, None).is_ok());
        assert_eq!(factory.contexts(), [None]);

        assert_eq!(
            factory.create(&OpenArgs::get("not a uri"), None).err(),
            Some(NetError::MalformedUri)
        );

        factory.deny_host("example.org");
        assert_eq!(
            factory.create(&args, None).err(),
            Some(NetError::PermissionDenied)
        );

        factory.set_offline(true);
        assert_eq!(factory.create(&args, None).err(), Some(NetError::Offline));
    }

    #[test]
    fn unknown_uri_refuses_open() {
        let factory = ScriptedFactory::new();
        let created = factory.create(&OpenArgs::get("https://nowhere.example/"), None);
        let mut request = created.unwrap_or_else(|_| unreachable!());
        assert_eq!(request.async_open(), Err(NetError::ConnectionRefused));
        assert!(factory.probe("https://nowhere.example/").is_some());
    }
}
