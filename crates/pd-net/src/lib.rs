//! Network request contracts consumed by channel actors, plus an in-memory
//! scripted transport.

pub mod listener;
pub mod request;
pub mod scripted;
pub mod url;

pub use listener::ListenerEvent;
pub use listener::RecordingListener;
pub use request::DataChunk;
pub use request::NetworkRequest;
pub use request::RedirectFlags;
pub use request::RequestEvent;
pub use request::RequestFactory;
pub use request::RequestView;
pub use request::StreamListener;
pub use scripted::RequestProbe;
pub use scripted::Script;
pub use scripted::ScriptedFactory;
pub use scripted::ScriptedRequest;
pub use url::ChannelUri;
pub use url::Scheme;
