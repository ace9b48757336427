use mockpod_http::{parse_connect_request_line, ConnectParseError};
use proptest::prelude::*;

fn host_strategy() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z0-9](?:[a-z0-9.-]{0,30}[a-z0-9])?")
        .expect("valid hostname regex")
}

proptest! {
    #[test]
    fn accepts_canonical_connect_lines(host in host_strategy(), port in 1_u16..=u16::MAX) {
        let line = format!("CONNECT {host}:{port} HTTP/1.1");
        let target = parse_connect_request_line(&line)
            .expect("canonical CONNECT line must parse");
        prop_assert_eq!(target.host, host);
        prop_assert_eq!(target.port, port);
    }

    #[test]
    fn defaults_to_port_443_when_authority_omits_it(host in host_strategy()) {
        let line = format!("CONNECT {host} HTTP/1.1");
        let target = parse_connect_request_line(&line)
            .expect("portless CONNECT line must parse");
        prop_assert_eq!(target.host, host);
        prop_assert_eq!(target.port, 443);
    }

    #[test]
    fn rejects_lowercase_method(host in host_strategy(), port in 1_u16..=u16::MAX) {
        let line = format!("connect {host}:{port} HTTP/1.1");
        let error = parse_connect_request_line(&line)
            .expect_err("lowercase method must be rejected");
        prop_assert_eq!(error, ConnectParseError::MethodNotConnect);
    }

    #[test]
    fn rejects_out_of_range_ports(host in host_strategy(), port in 65_536_u32..=1_000_000) {
        let line = format!("CONNECT {host}:{port} HTTP/1.1");
        let error = parse_connect_request_line(&line)
            .expect_err("oversized port must be rejected");
        prop_assert_eq!(error, ConnectParseError::InvalidPort);
    }

    #[test]
    fn never_panics_on_arbitrary_request_lines(line in "\\PC{0,120}") {
        let _ = parse_connect_request_line(&line);
    }
}
