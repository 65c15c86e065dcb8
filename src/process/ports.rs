use std::io;
use std::net::TcpListener;

/// Ask the OS for a free port on the loopback interface.
///
/// The listener is dropped before returning, so the port is only likely to still be free when the
/// backend binds it.
pub fn free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
