use tracing_forest::tree::Tree;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Overrides the default test log filter, e.g. `ascom_alpaca_discovery::server=trace`.
const LOG_FILTER_ENV: &str = "ALPACA_DISCOVERY_TEST_LOG";

/// Drops span trees that didn't log anything.
///
/// Every discovery socket gets its own span, and most of them stay silent.
struct SkipSilentSpans<P>(P);

fn has_events(tree: &Tree) -> bool {
    match tree {
        Tree::Span(span) => span.nodes().iter().any(has_events),
        Tree::Event(_) => true,
    }
}

impl<P: tracing_forest::Processor> tracing_forest::Processor for SkipSilentSpans<P> {
    fn process(&self, tree: Tree) -> tracing_forest::processor::Result {
        if has_events(&tree) {
            self.0.process(tree)
        } else {
            Ok(())
        }
    }
}

/// Icon for the part of the crate an event comes from.
fn module_icon(module: &str) -> Option<char> {
    let (section, rest) = module.split_once("::").unwrap_or((module, ""));

    Some(match (section, rest) {
        ("discovery", _) => '🔍',
        ("client", rest) if rest.starts_with("engine") => '🔭',
        ("client", rest) if rest.starts_with("management") || rest.starts_with("dns") => '🌐',
        ("client", _) => '📡',
        ("server", _) => '🏭',
        ("test_utils", _) => '🧪',
        _ => return None,
    })
}

fn module_tag(event: &tracing::Event<'_>) -> Option<tracing_forest::Tag> {
    let module = event
        .metadata()
        .target()
        .strip_prefix("ascom_alpaca_discovery::")?;

    let builder = tracing_forest::Tag::builder()
        .prefix(module)
        .level(*event.metadata().level());

    Some(match module_icon(module) {
        Some(icon) => builder.icon(icon).build(),
        None => builder.build(),
    })
}

fn log_targets() -> Targets {
    std::env::var(LOG_FILTER_ENV)
        .ok()
        .and_then(|filter| filter.parse().ok())
        .unwrap_or_else(|| {
            Targets::new()
                .with_target("ascom_alpaca_discovery", tracing::Level::INFO)
                .with_target("ascom_alpaca_discovery::client::engine", tracing::Level::DEBUG)
        })
}

#[ctor::ctor]
fn prepare_test_env() {
    unsafe {
        std::env::set_var("RUST_BACKTRACE", "full");
    }

    tracing_subscriber::registry()
        .with(log_targets())
        .with(tracing_forest::ForestLayer::new(
            SkipSilentSpans(tracing_forest::printer::TestCapturePrinter::new()),
            module_tag,
        ))
        .with(tracing_error::ErrorLayer::default())
        .init();

    color_eyre::config::HookBuilder::default()
        .add_frame_filter(Box::new(|frames| {
            // Socket and HTTP plumbing frames only add noise.
            frames.retain(|frame| {
                frame
                    .filename
                    .as_ref()
                    .is_some_and(|filename| filename.starts_with(env!("CARGO_MANIFEST_DIR")))
            });
        }))
        .install()
        .expect("Failed to install color_eyre");
}
