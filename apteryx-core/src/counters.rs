//! Global operation counters, surfaced read-only under `/apteryx/counters/`.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        /// One atomic tally per engine event.
        #[derive(Debug, Default)]
        pub struct Counters {
            $(pub $name: AtomicU32,)*
        }

        impl Counters {
            /// Counter names in declaration order, as exposed by the
            /// built-in indexer.
            pub const NAMES: &'static [&'static str] = &[$(stringify!($name)),*];

            /// Look a counter up by its exposed name.
            pub fn get(&self, name: &str) -> Option<u32> {
                match name {
                    $(stringify!($name) => Some(self.$name.load(Ordering::Relaxed)),)*
                    _ => None,
                }
            }
        }
    };
}

counters! {
    set,
    set_invalid,
    get,
    get_invalid,
    query,
    search,
    search_invalid,
    traverse,
    traverse_invalid,
    find,
    find_invalid,
    prune,
    prune_invalid,
    timestamp,
    timestamp_invalid,
    memuse,
    memuse_invalid,
    indexed,
    indexed_no_handler,
    indexed_timeout,
    refreshed,
    refreshed_no_handler,
    refreshed_timeout,
    watched,
    watched_no_handler,
    watched_timeout,
    validated,
    validated_no_handler,
    validated_timeout,
    provided,
    provided_no_handler,
    provided_timeout,
    proxied,
    proxied_no_handler,
    proxied_timeout,
}

/// Bump a counter.
pub fn inc(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Relaxed);
}
