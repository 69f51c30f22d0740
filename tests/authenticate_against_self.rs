use std::sync::{
    mpsc::{channel, Receiver, Sender},
    Arc,
};

use gss_negotiate::{
    loopback::{LoopbackConfig, LoopbackProvider},
    oid::{GSS_C_NT_HOSTBASED_SERVICE, GSS_C_NT_USER_NAME},
    Credential, InitiateRequest, Principal, Provider, SecurityContext, StepOut, TokenBuffer,
};
use tracing_subscriber::EnvFilter;

enum Message {
    Token(Vec<u8>),
    Data(Vec<u8>),
}

const MESSAGE: &[u8] = b"Hi, Server!";
const TARGET: &str = "HTTP@www.example.com";

#[test]
fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let loopback = Arc::new(LoopbackProvider::with_config(LoopbackConfig::default().with_rounds(3)));
    let provider: Provider = loopback.clone();
    let (send, recv) = channel::<Message>();
    let (return_send, return_recv) = channel::<Vec<u8>>();

    let server_provider = provider.clone();
    let join_handle = std::thread::spawn(move || server(&server_provider, recv, return_send));

    let client_name = Principal::parse(&provider, "alice", &GSS_C_NT_USER_NAME).unwrap();
    let creds = Credential::outbound(&provider, Some(&client_name)).unwrap();
    let target = Principal::parse(&provider, TARGET, &GSS_C_NT_HOSTBASED_SERVICE).unwrap();
    let request = InitiateRequest::new(&target)
        .with_credential(&creds)
        .request_mutual_auth()
        .request_encryption();

    let mut client = SecurityContext::initiator(&provider);
    let mut answer: Option<TokenBuffer> = None;
    loop {
        match client.initiate(&request, answer.as_ref()) {
            StepOut::Finished(finished) => {
                eprintln!("[CLIENT] Context completed");
                assert!(finished.output_token.is_empty());
                break;
            }
            StepOut::Continue(token) => {
                eprintln!("[CLIENT] Sending Negotiate token");
                send.send(Message::Token(token.as_bytes().to_vec())).unwrap();
            }
            StepOut::Failed(err) => panic!("client failed: {err}"),
        }
        answer = Some(TokenBuffer::from(return_recv.recv().unwrap()));
        eprintln!("[CLIENT] Negotiate answer message received");
    }
    assert!(client.is_mutually_authenticated());

    let wrapped = client.wrap(true, MESSAGE).unwrap();
    assert!(wrapped.was_encrypted());
    send.send(Message::Data(wrapped.to_vec())).unwrap();

    join_handle.join().unwrap();
    drop(request);
    drop((wrapped, client, creds, client_name, target, answer));
    assert_eq!(loopback.live_handles(), 0);
    assert_eq!(loopback.outstanding_buffers(), 0);
}

fn server(provider: &Provider, recv: Receiver<Message>, return_sender: Sender<Vec<u8>>) {
    let service = Principal::parse(provider, TARGET, &GSS_C_NT_HOSTBASED_SERVICE).unwrap();
    let server_cred = Credential::inbound(provider, Some(&service)).unwrap();
    let mut context = SecurityContext::acceptor(provider);

    loop {
        let token = match recv.recv().unwrap() {
            Message::Token(payload) => TokenBuffer::from(payload),
            Message::Data(_) => panic!("not authenticated yet"),
        };
        eprintln!("[SERVER] Negotiate token received");
        match context.accept(Some(&server_cred), &token, None) {
            StepOut::Continue(reply) => return_sender.send(reply.as_bytes().to_vec()).unwrap(),
            StepOut::Finished(accepted) => {
                eprintln!("[SERVER] context completed");
                assert_eq!(accepted.source.to_string(), "alice");
                assert!(!accepted.output_token.is_empty());
                return_sender.send(accepted.output_token.as_bytes().to_vec()).unwrap();
                eprintln!("[SERVER] Mutual auth token sent");
                break;
            }
            StepOut::Failed(err) => panic!("server failed: {err}"),
        }
    }

    let Message::Data(data) = recv.recv().unwrap() else {
        panic!("expected application data")
    };
    let plain = context.unwrap(&data).unwrap();
    assert!(plain.was_encrypted());
    assert_eq!(&plain[..], MESSAGE);
}
