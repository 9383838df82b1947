//! Wire protocol: packet framing and message builders.

pub mod builder;
pub mod header;

pub use builder::{
    auth_ok, auth_request_cleartext, auth_request_md5, backend_key_data, cancel_request,
    error_message, fatal_message, get_cstr, parameter_status, parse_error_fields,
    parse_parameter_status, parse_startup_params, password_message, pooler_error,
    ready_for_query, simple_query, ssl_deny, startup_message, wrong_password,
};
pub use header::{get_header, PktHdr, PktType, NEW_HEADER_LEN, OLD_HEADER_LEN};
