//! ZMQ socket setup: bind-with-retry on the publish side (§4.2), matching
//! the original's randomized port selection but adding an actual bind
//! success check, since `pubsub_topicPublicationCreate` only retries a
//! fixed number of times without verifying `zsock_bind` actually claimed
//! the port before giving up.

use rand::Rng;

use pubsub_types::{PsError, PsResult};

const BIND_RETRY_CAP: u32 = 100;

/// Opens a `PUB` socket bound to a port in `[port_base, port_max]`, retrying
/// on `EADDRINUSE`. Returns the socket, the chosen port, and the endpoint
/// URL advertised to subscribers (`tcp://{advertise_host}:{port}`).
pub fn open_pub_socket(
    ctx: &zmq::Context,
    advertise_host: &str,
    port_base: u16,
    port_max: u16,
) -> PsResult<(zmq::Socket, u16, String)> {
    for _ in 0..BIND_RETRY_CAP {
        let socket = ctx.socket(zmq::PUB).map_err(zmq_err)?;
        let port = pick_port(port_base, port_max);
        match socket.bind(&format!("tcp://0.0.0.0:{port}")) {
            Ok(()) => {
                let url = format!("tcp://{advertise_host}:{port}");
                return Ok((socket, port, url));
            }
            Err(zmq::Error::EADDRINUSE) => continue,
            Err(e) => return Err(zmq_err(e)),
        }
    }
    Err(PsError::ServiceException(format!(
        "exhausted {BIND_RETRY_CAP} bind attempts in port range [{port_base}, {port_max}]"
    )))
}

fn pick_port(base: u16, max: u16) -> u16 {
    if max <= base {
        return base;
    }
    rand::thread_rng().gen_range(base..=max)
}

/// Opens a `SUB` socket with its subscription filter already applied.
/// `topic_filter` is the raw byte prefix to match — empty subscribes to
/// every topic, matching the wildcard's `zsock_set_subscribe(s, "")`.
pub fn open_sub_socket(ctx: &zmq::Context, topic_filter: &[u8]) -> PsResult<zmq::Socket> {
    let socket = ctx.socket(zmq::SUB).map_err(zmq_err)?;
    socket.set_subscribe(topic_filter).map_err(zmq_err)?;
    Ok(socket)
}

pub fn zmq_err(e: zmq::Error) -> PsError {
    PsError::from(std::io::Error::new(std::io::ErrorKind::Other, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_in_requested_range() {
        let ctx = zmq::Context::new();
        let (_socket, port, url) = open_pub_socket(&ctx, "127.0.0.1", 41000, 41100).unwrap();
        assert!((41000..=41100).contains(&port));
        assert!(url.contains(&port.to_string()));
    }
}
