//! Helpers shared by the test suites of the workspace crates.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use observability_deps::tracing;
use parking_lot::Once;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

static LOG_SETUP: Once = Once::new();

/// Start tracing output to the console if the `RUST_LOG` environment variable
/// is set. Call at the beginning of any test that wants log output.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Unconditionally install a console subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        LogTracer::init().expect("log forwarding to tracing");

        let subscriber = fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("setting global tracing subscriber");
    })
}

/// Assert that `haystack` contains `needle`, with a readable failure message.
#[macro_export]
macro_rules! assert_contains {
    ($haystack:expr, $needle:expr) => {{
        let haystack_value: String = $haystack.to_string();
        let needle_value: String = $needle.to_string();

        assert!(
            haystack_value.contains(&needle_value),
            "Can not find\n\n{}\n\nin\n\n{}",
            needle_value,
            haystack_value
        );
    }};
}

