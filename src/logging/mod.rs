//! Logging setup.
//!
//! Honors the `RUST_LOG` filter; ordering nodes typically run with
//! `RUST_LOG=kafka_consenter=debug`.

pub fn init_logging() {
    let directives =
        ::std::env::var("RUST_LOG").unwrap_or_else(|_| String::from("kafka_consenter=info"));
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&directives)
        .format_timestamp_millis()
        .init();
}
