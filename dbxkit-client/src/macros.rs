//! Declarative helpers for route tables

/// Declare a typed [`Route`](dbxkit_core::Route) in a `const` context.
///
/// # Example
///
/// ```rust
/// use dbxkit_client::route;
/// use dbxkit_core::Route;
///
/// const UPLOAD: Route<serde_json::Value, serde_json::Value, serde_json::Value> =
///     route!("files" / "upload", auth: [User], host: Content, style: Upload);
/// assert_eq!(UPLOAD.namespace_route_name(), "files/upload");
/// ```
#[macro_export]
macro_rules! route {
    ($namespace:literal / $name:literal, auth: [$($auth:ident),+ $(,)?], host: $host:ident, style: $style:ident) => {
        $crate::__route_core::Route::new(
            $namespace,
            $name,
            $crate::__route_core::RouteAttributes {
                auth: &[$($crate::__route_core::AuthType::$auth),+],
                host: $crate::__route_core::RouteHost::$host,
                style: $crate::__route_core::RouteStyle::$style,
            },
        )
    };
}

/// Build a [`RouteTable`](crate::RouteTable) from `kind route => variant` lines.
///
/// # Example
///
/// ```rust
/// use dbxkit_client::{route, route_table, DownloadRequestFile, UploadRequest};
/// use dbxkit_core::Route;
///
/// const UPLOAD: Route<(), (), ()> = route!("files" / "upload", auth: [User], host: Content, style: Upload);
/// const DOWNLOAD: Route<(), (), ()> = route!("files" / "download", auth: [User], host: Content, style: Download);
///
/// enum Resumed {
///     Upload(UploadRequest<(), ()>),
///     Download(DownloadRequestFile<(), ()>),
/// }
///
/// let table = route_table! {
///     upload UPLOAD => Resumed::Upload,
///     download_file DOWNLOAD => Resumed::Download,
/// };
/// assert_eq!(table.len(), 2);
/// ```
#[macro_export]
macro_rules! route_table {
    ($($kind:ident $route:expr => $wrap:expr),* $(,)?) => {{
        let table = $crate::RouteTable::new();
        $(
            let table = table.$kind(&$route, $wrap);
        )*
        table
    }};
}
