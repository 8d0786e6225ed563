//! Templates compiled into the binary with `include_str!`, so a run needs no
//! template files on disk.

/// Client configuration uploaded as `client.rb`
pub static CLIENT_CONFIG: &str = include_str!("templates/client.rb.j2");

/// systemd unit running the client at boot
pub static SERVICE_UNIT: &str = include_str!("templates/chef-run.service.j2");

pub const CLIENT_CONFIG_TEMPLATE: &str = "client.rb.j2";
pub const SERVICE_UNIT_TEMPLATE: &str = "chef-run.service.j2";

/// All embedded templates as (name, content) pairs for registration with Tera.
pub const ALL_TEMPLATES: &[(&str, &str)] = &[
    (CLIENT_CONFIG_TEMPLATE, CLIENT_CONFIG),
    (SERVICE_UNIT_TEMPLATE, SERVICE_UNIT),
];
