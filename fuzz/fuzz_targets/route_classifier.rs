#![no_main]

use std::collections::HashSet;

use arbitrary::Arbitrary;
use citadel_edge_networking::{Destination, Method, Request, RequestMode, RouteClass, RouteTable};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct RouteInput {
    url: String,
    method: String,
    destination: String,
    mode: String,
    precached: Vec<String>,
    trusted: Vec<String>,
}

fuzz_target!(|input: RouteInput| {
    let Ok(url) = url::Url::parse(&input.url) else {
        return;
    };
    let method: Method = input.method.parse().unwrap_or(Method::GET);
    let request = Request::from_url(method, url.clone())
        .with_destination(Destination::from_header(&input.destination))
        .with_mode(RequestMode::from_header(&input.mode));

    let table = RouteTable::standard(input.precached.into_iter().collect::<HashSet<_>>(), input.trusted);
    let matched = table.classify(&request);

    if ["chrome-extension", "moz-extension", "safari-web-extension"].contains(&url.scheme()) {
        assert_eq!(matched.class, RouteClass::ExtensionResource);
    }
});
