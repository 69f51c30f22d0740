#![cfg(feature = "native-tls")]

use std::{
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
};

use gss_negotiate::{
    channel_bindings::ChannelBindings, loopback::LoopbackProvider, oid::GSS_KRB5_NT_PRINCIPAL_NAME,
    InitiateRequest, Principal, Provider, SecurityContext, StepOut,
};
use native_tls::{Identity, TlsAcceptor, TlsConnector};

const CERT: &[u8] = include_bytes!("data/localhost.crt");
const KEY: &[u8] = include_bytes!("data/localhost.key");

#[test]
fn both_ends_of_a_tls_stream_bind_to_the_server_certificate() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::new(Identity::from_pkcs8(CERT, KEY).unwrap()).unwrap();
    let server = thread::spawn(move || {
        let (tcp, _) = listener.accept().unwrap();
        let stream = acceptor.accept(tcp).unwrap();
        ChannelBindings::from_channel(&stream).unwrap()
    });

    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let stream = connector
        .connect("localhost", TcpStream::connect(addr).unwrap())
        .unwrap();
    let client_bindings = ChannelBindings::from_channel(&stream).unwrap().expect("RSA certificate");
    let server_bindings = server.join().unwrap().expect("RSA certificate");

    assert_eq!(client_bindings, server_bindings);
    let data = client_bindings.application_data();
    assert!(data.starts_with(b"tls-server-end-point:"));
    // SHA-256 of the certificate
    assert_eq!(data.len(), b"tls-server-end-point:".len() + 32);

    let loopback = Arc::new(LoopbackProvider::new());
    let provider: Provider = loopback.clone();
    let target = Principal::parse(&provider, "HTTP/localhost", &GSS_KRB5_NT_PRINCIPAL_NAME).unwrap();
    let request = InitiateRequest::new(&target).bind_to_channel(&stream).unwrap();
    let mut client = SecurityContext::initiator(&provider);
    let StepOut::Finished(initiated) = client.initiate(&request, None) else {
        panic!("single round");
    };
    let mut server = SecurityContext::acceptor(&provider);
    assert!(server
        .accept(None, &initiated.output_token, Some(&server_bindings))
        .is_finished());
}
