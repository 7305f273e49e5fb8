//! UDP endpoints and realtime scheduling for the relay.
//!
//! The sender is connected to the peer with a deliberately tiny send buffer:
//! datagrams are produced at audio rate and must never queue. The receiver
//! gets an enlarged kernel buffer to absorb burst arrivals and a short read
//! timeout so the receive loop can notice the stop flag between blocks.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Receive timeout; bounds how long stop-flag observation can take.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Kernel receive buffer, sized to absorb packet bursts.
pub const RECV_BUFFER_BYTES: usize = 1024 * 1024;

/// Kernel send buffer; the engine never queues more than one datagram.
pub const SEND_BUFFER_BYTES: usize = 1024;

/// Create the sender socket, connected to the peer so the audio callback
/// can fire datagrams without per-send address resolution.
pub fn connect_sender(peer: SocketAddrV4) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(Error::SocketSetup)?;

    socket
        .set_send_buffer_size(SEND_BUFFER_BYTES)
        .map_err(Error::SocketSetup)?;

    socket
        .bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
        .map_err(Error::SocketSetup)?;

    socket.set_nonblocking(true).map_err(Error::SocketSetup)?;

    socket
        .connect(&SockAddr::from(peer))
        .map_err(Error::SocketSetup)?;

    let socket: UdpSocket = socket.into();

    #[cfg(windows)]
    disable_connreset(&socket);

    debug!("sender connected to {}", peer);
    Ok(socket)
}

/// Create the receiver socket, bound on all interfaces with the enlarged
/// buffer and the short read timeout.
pub fn bind_receiver(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(Error::SocketSetup)?;

    socket
        .set_recv_buffer_size(RECV_BUFFER_BYTES)
        .map_err(Error::SocketSetup)?;

    socket
        .set_read_timeout(Some(READ_TIMEOUT))
        .map_err(Error::SocketSetup)?;

    socket
        .bind(&SockAddr::from(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            port,
        )))
        .map_err(Error::SocketSetup)?;

    let socket: UdpSocket = socket.into();

    #[cfg(windows)]
    disable_connreset(&socket);

    debug!("receiver bound on port {}", port);
    Ok(socket)
}

/// Keep ICMP port-unreachable from surfacing as socket errors, so a
/// temporarily absent peer does not terminate the receive loop.
#[cfg(windows)]
fn disable_connreset(socket: &UdpSocket) {
    use std::os::windows::io::AsRawSocket;
    use windows_sys::Win32::Networking::WinSock::{WSAIoctl, SOCKET};

    // _WSAIOW(IOC_VENDOR, 12)
    const SIO_UDP_CONNRESET: u32 = 0x9800000C;

    let mut enable: u32 = 0;
    let mut bytes_returned: u32 = 0;
    let rc = unsafe {
        WSAIoctl(
            socket.as_raw_socket() as SOCKET,
            SIO_UDP_CONNRESET,
            &mut enable as *mut u32 as *mut core::ffi::c_void,
            std::mem::size_of::<u32>() as u32,
            std::ptr::null_mut(),
            0,
            &mut bytes_returned,
            std::ptr::null_mut(),
            None,
        )
    };
    if rc != 0 {
        warn!("failed to disable UDP connection reset reporting");
    }
}

/// Ask the OS for the realtime scheduling class on the calling thread.
/// Failure is expected on unprivileged setups and only degrades jitter, so
/// it is logged and ignored.
pub fn set_realtime_priority() {
    #[cfg(unix)]
    {
        let param = libc::sched_param { sched_priority: 90 };
        let rc = unsafe {
            libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
        };
        if rc != 0 {
            warn!(
                "failed to set SCHED_FIFO priority 90: {}",
                std::io::Error::from_raw_os_error(rc)
            );
        } else {
            debug!("receive thread running with SCHED_FIFO priority 90");
        }
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Threading::{
            GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
        };
        let ok = unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL) };
        if ok == 0 {
            warn!("failed to raise thread priority to time-critical");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_times_out() {
        let socket = bind_receiver(0).unwrap();
        let mut buf = [0u8; 16];
        let start = std::time::Instant::now();
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ));
        assert!(start.elapsed() < READ_TIMEOUT * 3);
    }

    #[test]
    fn test_sender_reaches_receiver() {
        let receiver = bind_receiver(0).unwrap();
        let port = receiver.local_addr().unwrap().port();
        let sender =
            connect_sender(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();

        sender.send(&[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_sender_to_absent_peer_does_not_fail_setup() {
        // Nobody listens on this port; creating and sending must still work
        // (fire-and-forget).
        let sender =
            connect_sender(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)).unwrap();
        let _ = sender.send(&[0u8; 8]);
    }
}
