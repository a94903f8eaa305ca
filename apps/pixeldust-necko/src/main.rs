//! Drives a parent registry and its content processes over in-memory
//! endpoints, then prints what each content-side listener received.

use pd_channel::ActorKey;
use pd_channel::ProcessId;
use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_core::NetResult;
use pd_ipc::ChannelConfig;
use pd_ipc::LoadContextSnapshot;
use pd_ipc::OpenArgs;
use pd_ipc::ProcessRole;
use pd_ipc::RedirectRequest;
use pd_ipc::local_channel_pair;
use pd_necko::NeckoChild;
use pd_necko::NeckoConfig;
use pd_necko::NeckoParent;
use pd_necko::OriginIsolationPolicy;
use pd_necko::ProcessListener;
use pd_net::ChannelUri;
use pd_net::RecordingListener;
use pd_net::RedirectFlags;
use pd_net::Script;
use pd_net::ScriptedFactory;
use pd_net::StreamListener;
use pd_security::BrowsingContext;
use std::process::ExitCode;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PIXELDUST_LOG";
const DEFAULT_URL: &str = "https://pixeldust.example/";
const MIRROR_URL: &str = "https://mirror.pixeldust.example/";
const APP_ID: u32 = 1;
const MAX_TURNS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
struct DemoOptions {
    url: String,
    divert: bool,
    cross_process: bool,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_owned(),
            divert: false,
            cross_process: false,
        }
    }
}

fn main() -> ExitCode {
    install_tracing();

    let options = match options_from_args(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(error) => {
            eprintln!("pixeldust-necko startup error: {error}");
            return ExitCode::from(2);
        }
    };

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(code = error.code, "demo session failed");
            eprintln!("pixeldust-necko error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn install_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn options_from_args(args: impl IntoIterator<Item = String>) -> Result<DemoOptions, String> {
    let mut options = DemoOptions::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--divert" => options.divert = true,
            "--cross-process" => options.cross_process = true,
            "--url" => {
                options.url = args
                    .next()
                    .ok_or_else(|| "missing value for --url".to_owned())?;
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    if options.divert && options.cross_process {
        return Err("--divert and --cross-process cannot be combined".to_owned());
    }
    Ok(options)
}

/// Hands every incoming redirect to one recording listener.
struct RedirectTarget(RecordingListener);

impl ProcessListener for RedirectTarget {
    fn listener_for(&mut self, redirect: &RedirectRequest) -> NetResult<Box<dyn StreamListener>> {
        info!(target_uri = %redirect.target_uri, "accepting cross-process redirect");
        Ok(Box::new(self.0.clone()))
    }
}

struct Demo {
    parent: NeckoParent,
    factory: ScriptedFactory,
    children: Vec<(ProcessId, NeckoChild)>,
}

impl Demo {
    fn new(processes: usize) -> BrowserResult<Self> {
        let config = NeckoConfig::from_env(ProcessRole::Parent)?;
        let factory = ScriptedFactory::new();
        let mut parent = NeckoParent::new(config, Box::new(factory.clone()))?;
        let mut children = Vec::with_capacity(processes);
        for _ in 0..processes {
            let (parent_end, child_end) = local_channel_pair(
                ChannelConfig::hardened(ProcessRole::Parent)?,
                ChannelConfig::hardened(ProcessRole::Child)?,
            )?;
            let process = parent.add_content_process(parent_end)?;
            parent.add_browsing_context(process, BrowsingContext::new(APP_ID, false))?;
            children.push((process, NeckoChild::new(child_end)?));
        }
        Ok(Self {
            parent,
            factory,
            children,
        })
    }

    fn settle(&mut self) -> BrowserResult<()> {
        for _ in 0..MAX_TURNS {
            let mut progress = self.parent.turn()?;
            for (process, child) in &mut self.children {
                if self.parent.has_process(*process) {
                    progress += child.turn()?;
                }
            }
            if progress == 0 {
                return Ok(());
            }
        }
        Err(BrowserError::new(
            "demo.not_settled",
            format!("session still busy after {MAX_TURNS} turns"),
        ))
    }
}

fn run(options: &DemoOptions) -> BrowserResult<()> {
    let uri = ChannelUri::parse(&options.url)?;
    let body = Script::new("text/html")
        .data("<!doctype html>")
        .data("<p>pixeldust</p>")
        .stop(Ok(()));

    let mut demo = Demo::new(if options.cross_process { 2 } else { 1 })?;
    let redirected = RecordingListener::new();
    if options.cross_process {
        let mirror = ChannelUri::parse(MIRROR_URL)?;
        let mut policy = OriginIsolationPolicy::new();
        policy.assign(mirror.origin(), demo.children[1].0);
        demo.parent.set_redirect_policy(Box::new(policy));
        demo.children[1]
            .1
            .set_process_listener(Box::new(RedirectTarget(redirected.clone())));
        let redirect = RedirectRequest {
            target_uri: mirror.as_str().to_owned(),
            new_load_flags: 0,
            load_info: Vec::new(),
            channel_id: 1,
            original_uri: uri.as_str().to_owned(),
            completion_identifier: 1,
        };
        demo.factory
            .serve(uri.as_str(), Script::redirect(redirect, RedirectFlags::TEMPORARY));
        demo.factory.serve(mirror.as_str(), body);
    } else {
        demo.factory.serve(uri.as_str(), body);
    }

    let listener = RecordingListener::new();
    let (process, child) = &mut demo.children[0];
    let process = *process;
    let id = child.open(
        OpenArgs::get(uri.as_str()),
        LoadContextSnapshot::content(APP_ID, false, false),
        Box::new(listener.clone()),
    )?;

    let diverted = RecordingListener::new();
    if options.divert {
        // Let the first notification through before taking over the response.
        demo.children[0].1.turn()?;
        demo.parent.turn()?;
        let key = ActorKey::new(process, id);
        demo.parent.suspend_for_diversion(key)?;
        demo.parent.divert_to(key, Box::new(diverted.clone()))?;
    }
    demo.settle()?;

    report("content", &listener);
    if options.divert {
        report("diverted", &diverted);
    }
    if options.cross_process {
        report("redirected", &redirected);
    }
    Ok(())
}

fn report(label: &str, listener: &RecordingListener) {
    let body = listener.body();
    info!(
        listener = label,
        starts = listener.starts(),
        stops = listener.stops(),
        status = ?listener.last_stop(),
        bytes = body.len(),
        "listener finished"
    );
    println!("{label}: {}", String::from_utf8_lossy(&body));
}
