use std::fmt;
use std::marker::PhantomData;

/// How the arguments and results of a route travel over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteStyle {
    /// JSON arguments in the body, JSON result in the body.
    Rpc,
    /// Arguments in the `Dropbox-Api-Arg` header, raw bytes in the body.
    Upload,
    /// Arguments in the `Dropbox-Api-Arg` header, result in the `Dropbox-Api-Result` header.
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteHost {
    Api,
    Content,
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthType {
    User,
    Team,
    App,
    NoAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteAttributes {
    pub auth: &'static [AuthType],
    pub host: RouteHost,
    pub style: RouteStyle,
}

impl RouteAttributes {
    pub fn requires(&self, auth: AuthType) -> bool {
        self.auth.contains(&auth)
    }
}

/// Static description of one endpoint, typed by argument, result and route error.
pub struct Route<A, R, E> {
    pub name: &'static str,
    pub namespace: &'static str,
    pub deprecated: bool,
    pub attributes: RouteAttributes,
    _types: PhantomData<fn() -> (A, R, E)>,
}

impl<A, R, E> Route<A, R, E> {
    pub const fn new(namespace: &'static str, name: &'static str, attributes: RouteAttributes) -> Self {
        Self {
            name,
            namespace,
            deprecated: false,
            attributes,
            _types: PhantomData,
        }
    }

    pub const fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    /// `namespace/name`, the key used when rebuilding reconnected requests.
    pub fn namespace_route_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl<A, R, E> Clone for Route<A, R, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A, R, E> Copy for Route<A, R, E> {}

impl<A, R, E> fmt::Debug for Route<A, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("attributes", &self.attributes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPLOAD: Route<(), (), ()> = Route::new(
        "files",
        "upload",
        RouteAttributes {
            auth: &[AuthType::User],
            host: RouteHost::Content,
            style: RouteStyle::Upload,
        },
    );

    #[test]
    fn test_route_key() {
        assert_eq!(UPLOAD.namespace_route_name(), "files/upload");
        assert!(UPLOAD.attributes.requires(AuthType::User));
        assert!(!UPLOAD.attributes.requires(AuthType::App));
        assert!(!UPLOAD.deprecated);
    }
}
