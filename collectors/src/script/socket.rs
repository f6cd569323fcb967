//! The `socket` capability: bounded raw TCP/UDP access for scripts that
//! speak a custom protocol (whois ports, banner grabs). Connections are
//! blocking with fixed timeouts; the worker thread owns them outright.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use mlua::{Lua, UserData, UserDataMethods, Value};

use crate::script::ScriptEnv;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(20);

/// Ceiling on one `recv_all` read, keeping a hostile endpoint from
/// ballooning the worker.
const MAX_READ: usize = 4 * 1024 * 1024;

enum Transport {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Closed,
}

struct SocketHandle {
    transport: Transport,
}

impl SocketHandle {
    fn connect(host: &str, port: u16, proto: &str) -> std::io::Result<Self> {
        let target = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::other("no address for host"))?;

        let transport = match proto {
            "udp" => {
                let socket = UdpSocket::bind(("0.0.0.0", 0))?;
                socket.set_read_timeout(Some(SOCKET_TIMEOUT))?;
                socket.set_write_timeout(Some(SOCKET_TIMEOUT))?;
                socket.connect(target)?;
                Transport::Udp(socket)
            }
            _ => {
                let stream = TcpStream::connect_timeout(&target, SOCKET_TIMEOUT)?;
                stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
                stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;
                Transport::Tcp(stream)
            }
        };
        Ok(Self { transport })
    }

    fn recv(&mut self, want: usize) -> std::io::Result<Vec<u8>> {
        let want = want.min(MAX_READ);
        let mut buf = vec![0u8; want];
        let used = match &mut self.transport {
            Transport::Tcp(stream) => stream.read(&mut buf)?,
            Transport::Udp(socket) => socket.recv(&mut buf)?,
            Transport::Closed => {
                return Err(std::io::Error::other("socket closed"));
            }
        };
        buf.truncate(used);
        Ok(buf)
    }

    fn recv_all(&mut self) -> std::io::Result<Vec<u8>> {
        match &mut self.transport {
            Transport::Tcp(stream) => {
                let mut buf = Vec::new();
                stream.take(MAX_READ as u64).read_to_end(&mut buf)?;
                Ok(buf)
            }
            Transport::Udp(_) => self.recv(64 * 1024),
            Transport::Closed => Err(std::io::Error::other("socket closed")),
        }
    }

    fn send(&mut self, data: &[u8]) -> std::io::Result<usize> {
        match &mut self.transport {
            Transport::Tcp(stream) => stream.write(data),
            Transport::Udp(socket) => socket.send(data),
            Transport::Closed => Err(std::io::Error::other("socket closed")),
        }
    }

    fn close(&mut self) {
        self.transport = Transport::Closed;
    }
}

impl UserData for SocketHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method_mut("recv", |lua, this, n: usize| match this.recv(n) {
            Ok(data) => Ok((Some(lua.create_string(&data)?), None::<String>)),
            Err(err) => Ok((None, Some(err.to_string()))),
        });

        methods.add_method_mut("recv_all", |lua, this, ()| match this.recv_all() {
            Ok(data) => Ok((Some(lua.create_string(&data)?), None::<String>)),
            Err(err) => Ok((None, Some(err.to_string()))),
        });

        methods.add_method_mut("send", |_, this, data: mlua::String| {
            match this.send(&data.as_bytes()) {
                Ok(written) => Ok((Some(written), None::<String>)),
                Err(err) => Ok((None, Some(err.to_string()))),
            }
        });

        methods.add_method_mut("close", |_, this, ()| {
            this.close();
            Ok(())
        });
    }
}

pub(crate) fn register(lua: &Lua, env: &Arc<ScriptEnv>) -> mlua::Result<()> {
    let socket = lua.create_table()?;

    let e = Arc::clone(env);
    socket.set(
        "connect",
        lua.create_function(
            move |_, (_ctx, host, port, proto): (Value, String, u16, Option<String>)| {
                let proto = proto.unwrap_or_else(|| "tcp".to_string());
                match SocketHandle::connect(&host, port, &proto) {
                    Ok(handle) => {
                        log::debug!("{}: socket to {}:{} ({})", e.script_name, host, port, proto);
                        Ok((Some(handle), None::<String>))
                    }
                    Err(err) => Ok((None, Some(err.to_string()))),
                }
            },
        )?,
    )?;

    lua.globals().set("socket", socket)?;
    Ok(())
}
