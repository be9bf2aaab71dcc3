use axum::extract::Query;
use axum::http::Request;

/// +----------------------------------------------------------+
/// | STRUCTS | TRAITS                                         |
/// +----------+-------+-------+------------------------------+
/// | Traits:                                                  |
/// |   - ChannelResolver                                      |
/// | Structs:                                                 |
/// |   - NoChannels                                           |
/// |   - QueryChannels                                        |
/// +----------------------------------------------------------+

/// Maps an inbound stream request to the channels the client subscribes to.
///
/// An empty list makes the client a global-only subscriber.
pub trait ChannelResolver: Send + Sync {
    fn resolve(&self, request: &Request<()>) -> Vec<String>;
}

/// Subscribes every client to global events only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoChannels;

impl ChannelResolver for NoChannels {
    fn resolve(&self, _request: &Request<()>) -> Vec<String> {
        Vec::new()
    }
}

/// Reads a comma separated channel list from a query parameter,
/// e.g. `?channels=orders,trades`.
///
/// Empty segments are skipped. A missing parameter yields no channels. When
/// the parameter is repeated, the first occurrence wins.
#[derive(Debug, Clone)]
pub struct QueryChannels {
    name: String,
}

impl QueryChannels {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }
}

impl Default for QueryChannels {
    fn default() -> Self {
        Self::new("channels")
    }
}

impl ChannelResolver for QueryChannels {
    fn resolve(&self, request: &Request<()>) -> Vec<String> {
        let Ok(Query(params)) = Query::<Vec<(String, String)>>::try_from_uri(request.uri()) else {
            return Vec::new();
        };

        params
            .into_iter()
            .find(|(key, _)| *key == self.name)
            .map(|(_, value)| {
                value
                    .split(',')
                    .filter(|channel| !channel.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }
}
