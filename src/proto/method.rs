use std::fmt;

/// Methods exposed by the echo service
///
/// Full method paths are `"{service}/{name}"`, so the same handler can be
/// published as `ping/Stream` or `message/Stream` by configuration alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Unary request, unary response
    Echo,
    /// Unary request, streamed response
    Repeat,
    /// Bidirectional stream
    Stream,
}

impl Method {
    pub const ALL: [Method; 3] = [Method::Echo, Method::Repeat, Method::Stream];

    pub fn name(&self) -> &'static str {
        match self {
            Method::Echo => "Echo",
            Method::Repeat => "Repeat",
            Method::Stream => "Stream",
        }
    }

    /// Full path of this method on `service`
    pub fn path(&self, service: &str) -> String {
        format!("{service}/{}", self.name())
    }

    /// Resolves a full method path against `service`
    pub fn route(service: &str, path: &str) -> Option<Method> {
        let name = path.strip_prefix(service)?.strip_prefix('/')?;
        Method::ALL.into_iter().find(|method| method.name() == name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
