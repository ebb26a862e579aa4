mod logging_env;

#[cfg(feature = "client")]
mod fake_server;
#[cfg(feature = "client")]
pub(crate) use fake_server::FakeAlpacaServer;
