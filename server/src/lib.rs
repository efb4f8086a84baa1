#![deny(warnings)]

use {
    anyhow::{Context, Error, Result},
    futures::FutureExt,
    std::{future::Future, net::SocketAddr},
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::mpsc,
        task,
    },
    tracing::log,
};

pub const REPLY: &[u8] = b"Hi from server!";

async fn serve<F, Fut>(
    address: SocketAddr,
    handle: F,
) -> Result<(impl Future<Output = Result<()>>, SocketAddr)>
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Unable to listen on {address}"))?;

    let address = listener.local_addr()?;

    Ok((
        async move {
            loop {
                let (stream, peer) = listener.accept().await?;

                log::debug!("accepted connection from {peer}");

                task::spawn(handle(stream).map(|result| {
                    if let Err(e) = result {
                        log::warn!("error handling connection: {e:?}");
                    }
                }));
            }
        }
        .boxed(),
        address,
    ))
}

/// Echo everything back until the peer hangs up.
pub async fn serve_echo(
    address: SocketAddr,
) -> Result<(impl Future<Output = Result<()>>, SocketAddr)> {
    serve(address, |mut stream| async move {
        let mut buffer = vec![0; 1024];
        loop {
            let count = stream.read(&mut buffer).await?;
            if count == 0 {
                break Ok::<_, Error>(());
            }

            stream.write_all(&buffer[..count]).await?;
        }
    })
    .await
}

/// Read one message and close without answering.
pub async fn serve_silent(
    address: SocketAddr,
) -> Result<(impl Future<Output = Result<()>>, SocketAddr)> {
    serve(address, |mut stream| async move {
        let mut buffer = vec![0; 1024];
        let count = stream.read(&mut buffer).await?;
        log::debug!("closing after reading {count} bytes");
        Ok::<_, Error>(())
    })
    .await
}

/// Read one message, forward it to `received`, and answer with `reply`.
pub async fn serve_recording(
    address: SocketAddr,
    reply: &'static [u8],
    received: mpsc::UnboundedSender<Vec<u8>>,
) -> Result<(impl Future<Output = Result<()>>, SocketAddr)> {
    serve(address, move |mut stream| {
        let received = received.clone();
        async move {
            let mut buffer = vec![0; 1024];
            let count = stream.read(&mut buffer).await?;
            buffer.truncate(count);
            received.send(buffer)?;

            stream.write_all(reply).await?;
            Ok::<_, Error>(())
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        futures::{channel::oneshot, future},
        greeting_client::{AddressFamily, Target, GREETING},
        std::{
            net::{IpAddr, Ipv4Addr, Ipv6Addr},
            sync::Once,
        },
    };

    async fn run(target: Target) -> Result<Vec<u8>> {
        task::spawn_blocking(move || -> Result<Vec<u8>> {
            let connection = greeting_client::connect(&target)?;
            Ok(greeting_client::exchange(connection)?)
        })
        .await?
    }

    async fn start(
        serve: impl Future<
            Output = Result<(
                impl Future<Output = Result<()>> + Unpin + Send + 'static,
                SocketAddr,
            )>,
        >,
    ) -> Result<(oneshot::Sender<()>, SocketAddr)> {
        static ONCE: Once = Once::new();
        ONCE.call_once(pretty_env_logger::init);

        let (server, address) = serve.await?;

        let (tx, rx) = oneshot::channel::<()>();

        task::spawn(async move {
            drop(future::select(server, rx).await);
        });

        Ok((tx, address))
    }

    async fn test(
        host: &str,
        serve: impl Future<
            Output = Result<(
                impl Future<Output = Result<()>> + Unpin + Send + 'static,
                SocketAddr,
            )>,
        >,
    ) -> Result<Vec<u8>> {
        let (_tx, address) = start(serve).await?;
        run(Target::new(host, address.port())?).await
    }

    fn unused_port() -> Result<u16> {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        Ok(listener.local_addr()?.port())
    }

    fn assert_unreachable(result: Result<Vec<u8>>, expected: &Target) {
        match result {
            Err(e) => match e.downcast_ref::<greeting_client::Error>() {
                Some(greeting_client::Error::NoReachableAddress(target)) => {
                    assert_eq!(expected, target)
                }
                _ => panic!("unexpected error: {e:?}"),
            },
            Ok(response) => panic!("unexpected response: {response:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn echo_ipv4() -> Result<()> {
        let response = test("127.0.0.1", serve_echo((Ipv4Addr::LOCALHOST, 0).into())).await?;
        assert_eq!(GREETING, response.as_slice());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn echo_ipv6() -> Result<()> {
        let response = test("::1", serve_echo((Ipv6Addr::LOCALHOST, 0).into())).await?;
        assert_eq!(GREETING, response.as_slice());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn echo_localhost() -> Result<()> {
        let response = test("localhost", serve_echo((Ipv4Addr::LOCALHOST, 0).into())).await?;
        assert_eq!(GREETING, response.as_slice());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn localhost_reaches_ipv4_listener() -> Result<()> {
        let (_tx, address) = start(serve_echo((Ipv4Addr::LOCALHOST, 0).into())).await?;
        let target = Target::new("localhost", address.port())?;

        let candidate = task::spawn_blocking(move || -> Result<_> {
            let connection = greeting_client::connect(&target)?;
            let candidate = connection.candidate().clone();
            greeting_client::exchange(connection)?;
            Ok(candidate)
        })
        .await??;

        assert_eq!(AddressFamily::Ipv4, candidate.family);
        assert_eq!(IpAddr::V4(Ipv4Addr::LOCALHOST), candidate.address.ip());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_peer() -> Result<()> {
        let response = test("127.0.0.1", serve_silent((Ipv4Addr::LOCALHOST, 0).into())).await?;
        assert!(response.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn peer_receives_greeting() -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let response = test(
            "127.0.0.1",
            serve_recording((Ipv4Addr::LOCALHOST, 0).into(), REPLY, tx),
        )
        .await?;

        assert_eq!(REPLY, response.as_slice());
        assert_eq!(Some(GREETING.to_vec()), rx.recv().await);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refused() -> Result<()> {
        let target = Target::new("127.0.0.1", unused_port()?)?;
        assert_unreachable(run(target.clone()).await, &target);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unresolvable() -> Result<()> {
        let target = Target::new("example.invalid", 8080)?;
        assert_unreachable(run(target.clone()).await, &target);
        Ok(())
    }
}
