use std::collections::HashSet;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Relays,
    Relay,
    AllRelays,
    System,
    Reboot,
    Events,
    IsConnected,
}

#[derive(Debug, Clone, Copy)]
pub struct RouteSpec {
    pub kind: RouteKind,
    pub methods: &'static [Method],
    /// Segments in braces capture one path segment, e.g. `/relay/{id}/{state}`.
    pub pattern: &'static str,
}

const GET_POST: &[Method] = &[Method::Get, Method::Post];

pub const ROUTES: &[RouteSpec] = &[
    RouteSpec {
        kind: RouteKind::Relays,
        methods: GET_POST,
        pattern: "/relays",
    },
    RouteSpec {
        kind: RouteKind::Relay,
        methods: GET_POST,
        pattern: "/relay/{id}/{state}",
    },
    RouteSpec {
        kind: RouteKind::AllRelays,
        methods: GET_POST,
        pattern: "/allrelays/{state}",
    },
    RouteSpec {
        kind: RouteKind::System,
        methods: GET_POST,
        pattern: "/system",
    },
    RouteSpec {
        kind: RouteKind::Reboot,
        methods: GET_POST,
        pattern: "/reboot",
    },
    RouteSpec {
        kind: RouteKind::Reboot,
        methods: GET_POST,
        pattern: "/reset",
    },
    RouteSpec {
        kind: RouteKind::Events,
        methods: GET_POST,
        pattern: "/events",
    },
    RouteSpec {
        kind: RouteKind::IsConnected,
        methods: GET_POST,
        pattern: "/is_connected",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRequest {
    Relays,
    SetRelay { id: String, state: String },
    SetAll { state: String },
    System,
    Reboot,
    Events,
    IsConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("route `{0}` must start with `/`")]
    NotAbsolute(&'static str),
    #[error("route `{0}` accepts no methods")]
    NoMethods(&'static str),
    #[error("route `{0}` is registered twice")]
    Duplicate(&'static str),
    #[error("route `{pattern}` has {found} parameters, {kind:?} needs {expected}")]
    Parameters {
        pattern: &'static str,
        kind: RouteKind,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmatched {
    NotFound,
    MethodNotAllowed,
}

impl RouteKind {
    fn parameter_count(self) -> usize {
        match self {
            Self::Relay => 2,
            Self::AllRelays => 1,
            _ => 0,
        }
    }
}

impl RouteSpec {
    pub fn parameters(&self) -> usize {
        self.pattern
            .split('/')
            .filter(|segment| is_parameter(segment))
            .count()
    }

    /// Prefix up to the first parameter with a trailing `*`, for servers that only
    /// support wildcard URI matching.
    pub fn wildcard(&self) -> String {
        match self.pattern.find('{') {
            Some(index) => format!("{}*", &self.pattern[..index]),
            None => self.pattern.to_string(),
        }
    }

    pub fn capture<'a>(&self, path: &'a str) -> Option<Vec<&'a str>> {
        let mut expected = self.pattern.split('/');
        let mut actual = path.split('/');
        let mut captured = Vec::new();

        loop {
            match (expected.next(), actual.next()) {
                (None, None) => return Some(captured),
                (Some(want), Some(got)) if is_parameter(want) => {
                    if got.is_empty() {
                        return None;
                    }
                    captured.push(got);
                }
                (Some(want), Some(got)) if want == got => {}
                _ => return None,
            }
        }
    }
}

fn is_parameter(segment: &str) -> bool {
    segment.len() > 2 && segment.starts_with('{') && segment.ends_with('}')
}

/// Checks the table once before any server binds to it.
pub fn validate_routes(routes: &[RouteSpec]) -> Result<(), RouteError> {
    let mut seen = HashSet::new();
    for route in routes {
        if !route.pattern.starts_with('/') {
            return Err(RouteError::NotAbsolute(route.pattern));
        }
        if route.methods.is_empty() {
            return Err(RouteError::NoMethods(route.pattern));
        }
        if !seen.insert(route.pattern) {
            return Err(RouteError::Duplicate(route.pattern));
        }
        let found = route.parameters();
        let expected = route.kind.parameter_count();
        if found != expected {
            return Err(RouteError::Parameters {
                pattern: route.pattern,
                kind: route.kind,
                expected,
                found,
            });
        }
    }
    Ok(())
}

/// Maps a request line onto the route table. Any query string is ignored.
pub fn resolve(method: Method, uri: &str) -> Result<ApiRequest, Unmatched> {
    let path = uri.split_once('?').map_or(uri, |(path, _)| path);

    let mut path_matched = false;
    for route in ROUTES {
        let Some(params) = route.capture(path) else {
            continue;
        };
        if !route.methods.contains(&method) {
            path_matched = true;
            continue;
        }

        let request = match (route.kind, params.as_slice()) {
            (RouteKind::Relays, []) => ApiRequest::Relays,
            (RouteKind::Relay, [id, state]) => ApiRequest::SetRelay {
                id: (*id).to_string(),
                state: (*state).to_string(),
            },
            (RouteKind::AllRelays, [state]) => ApiRequest::SetAll {
                state: (*state).to_string(),
            },
            (RouteKind::System, []) => ApiRequest::System,
            (RouteKind::Reboot, []) => ApiRequest::Reboot,
            (RouteKind::Events, []) => ApiRequest::Events,
            (RouteKind::IsConnected, []) => ApiRequest::IsConnected,
            _ => continue,
        };
        return Ok(request);
    }

    Err(if path_matched {
        Unmatched::MethodNotAllowed
    } else {
        Unmatched::NotFound
    })
}
