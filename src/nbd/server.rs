//! NBD server over a Unix domain socket
//!
//! The accept loop hands each connection to its own thread, which runs
//! the whole negotiation and transmission for that client. Exports are
//! registered before [`Server::serve`] and never change afterwards, so
//! connection threads share them without locking.

use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use super::protocol::*;
use crate::block::{BlockRead, BlockWrite, SharedReader, SharedWriter};

/// A named block device to expose.
pub struct Export {
    /// Name clients select during negotiation.
    pub name: String,
    /// Size of the export in bytes.
    pub size: u64,
    pub reader: SharedReader,
    /// Present only for read-write exports.
    pub writer: Option<SharedWriter>,
}

/// The NBD server.
pub struct Server {
    socket_path: PathBuf,
    exports: Vec<Arc<Export>>,
}

impl Server {
    pub fn new<P: Into<PathBuf>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.into(),
            exports: Vec::new(),
        }
    }

    /// Register an export. Export names must be unique; registration is
    /// only possible before [`Server::serve`].
    pub fn add_export(&mut self, export: Export) -> io::Result<()> {
        if self.exports.iter().any(|e| e.name == export.name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("export {:?} already exists", export.name),
            ));
        }
        self.exports.push(Arc::new(export));
        Ok(())
    }

    /// Listen and serve until the process exits. Each connection runs on
    /// its own thread.
    pub fn serve(&self) -> io::Result<()> {
        if self.exports.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no exports defined",
            ));
        }

        // A stale socket from a previous run would make bind fail.
        match fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        if let Err(e) =
            fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(0o660))
        {
            log::warn!("failed to chmod socket: {e}");
        }

        log::info!("listening on unix:{}", self.socket_path.display());
        for exp in &self.exports {
            let ro = if exp.writer.is_none() {
                " (read-only)"
            } else {
                ""
            };
            log::info!("export {:?}: {} bytes{}", exp.name, exp.size, ro);
        }
        log::info!(
            "connect with: sudo nbd-client -N <export-name> -unix {} /dev/nbdX",
            self.socket_path.display()
        );

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let exports = self.exports.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, exports) {
                            if e.kind() == io::ErrorKind::UnexpectedEof {
                                log::info!("client disconnected");
                            } else {
                                log::warn!("connection error: {e}");
                            }
                        }
                    });
                }
                Err(e) => log::error!("accept error: {e}"),
            }
        }

        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.socket_path);
    }
}

struct Session {
    reader: BufReader<UnixStream>,
    writer: BufWriter<UnixStream>,
    exports: Vec<Arc<Export>>,
    no_zeroes: bool,
}

fn handle_connection(stream: UnixStream, exports: Vec<Arc<Export>>) -> io::Result<()> {
    log::info!("new connection");

    let mut sess = Session {
        reader: BufReader::new(stream.try_clone()?),
        writer: BufWriter::new(stream),
        exports,
        no_zeroes: false,
    };

    let export = sess.negotiate()?;
    log::info!(
        "transmission phase for export {:?} ({} bytes)",
        export.name,
        export.size
    );
    sess.transmit(&export)
}

fn transmission_flags(export: &Export) -> u16 {
    let mut flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_FUA;
    if export.writer.is_none() {
        flags |= NBD_FLAG_READ_ONLY;
    }
    flags
}

impl Session {
    /// Fixed-newstyle handshake and option haggling. Returns the export
    /// the client settled on; negotiation never sends transmission-phase
    /// frames.
    fn negotiate(&mut self) -> io::Result<Arc<Export>> {
        write_greeting(&mut self.writer)?;

        let client_flags = self.reader.read_u32::<BigEndian>()?;
        self.no_zeroes = client_flags & NBD_FLAG_C_NO_ZEROES != 0;
        log::debug!("client flags: {client_flags:#010x}");

        loop {
            let opt = OptionHeader::read(&mut self.reader)?;
            log::debug!("option {} ({} bytes)", opt.option, opt.data.len());

            match opt.option {
                NBD_OPT_EXPORT_NAME => {
                    let name = String::from_utf8_lossy(&opt.data).into_owned();
                    let export = self.find_export(&name).ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("unknown export: {name:?}"),
                        )
                    })?;
                    self.send_oldstyle_export_info(&export)?;
                    return Ok(export);
                }

                NBD_OPT_GO => {
                    let mut name = String::new();
                    if opt.data.len() >= 4 {
                        let name_len = BigEndian::read_u32(&opt.data[0..4]) as usize;
                        if name_len > 0 && 4 + name_len <= opt.data.len() {
                            name = String::from_utf8_lossy(&opt.data[4..4 + name_len])
                                .into_owned();
                        }
                    }

                    // An empty name selects the first registered export.
                    let export = if name.is_empty() {
                        self.exports.first().cloned()
                    } else {
                        self.find_export(&name)
                    };

                    match export {
                        None => {
                            write_option_reply(
                                &mut self.writer,
                                opt.option,
                                NBD_REP_ERR_UNKNOWN,
                                &[],
                            )?;
                        }
                        Some(export) => {
                            self.send_go_export_info(opt.option, &export)?;
                            return Ok(export);
                        }
                    }
                }

                NBD_OPT_LIST => {
                    for exp in &self.exports {
                        let mut data = vec![0u8; 4 + exp.name.len()];
                        BigEndian::write_u32(&mut data[0..4], exp.name.len() as u32);
                        data[4..].copy_from_slice(exp.name.as_bytes());
                        write_option_reply(&mut self.writer, opt.option, NBD_REP_SERVER, &data)?;
                    }
                    write_option_reply(&mut self.writer, opt.option, NBD_REP_ACK, &[])?;
                }

                NBD_OPT_ABORT => {
                    write_option_reply(&mut self.writer, opt.option, NBD_REP_ACK, &[])?;
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "client aborted",
                    ));
                }

                _ => {
                    write_option_reply(&mut self.writer, opt.option, NBD_REP_ERR_UNSUP, &[])?;
                }
            }
        }
    }

    fn find_export(&self, name: &str) -> Option<Arc<Export>> {
        self.exports.iter().find(|e| e.name == name).cloned()
    }

    /// NBD_OPT_EXPORT_NAME reply: size and flags, padded to 134 bytes
    /// unless the client negotiated no-zeroes.
    fn send_oldstyle_export_info(&mut self, export: &Export) -> io::Result<()> {
        let mut resp = vec![0u8; if self.no_zeroes { 10 } else { 134 }];
        BigEndian::write_u64(&mut resp[0..8], export.size);
        BigEndian::write_u16(&mut resp[8..10], transmission_flags(export));
        self.writer.write_all(&resp)?;
        self.writer.flush()
    }

    /// NBD_OPT_GO replies: INFO_EXPORT, INFO_BLOCK_SIZE, then ACK.
    fn send_go_export_info(&mut self, option: u32, export: &Export) -> io::Result<()> {
        let mut info = [0u8; 12];
        BigEndian::write_u16(&mut info[0..2], NBD_INFO_EXPORT);
        BigEndian::write_u64(&mut info[2..10], export.size);
        BigEndian::write_u16(&mut info[10..12], transmission_flags(export));
        write_option_reply(&mut self.writer, option, NBD_REP_INFO, &info)?;

        let mut block = [0u8; 14];
        BigEndian::write_u16(&mut block[0..2], NBD_INFO_BLOCK_SIZE);
        BigEndian::write_u32(&mut block[2..6], 1);
        BigEndian::write_u32(&mut block[6..10], DEFAULT_BLOCK_SIZE);
        BigEndian::write_u32(&mut block[10..14], MAX_BLOCK_SIZE);
        write_option_reply(&mut self.writer, option, NBD_REP_INFO, &block)?;

        write_option_reply(&mut self.writer, option, NBD_REP_ACK, &[])
    }

    /// Transmission phase: requests are served strictly in order; I/O
    /// failures answer the one request with EIO and keep the session.
    fn transmit(&mut self, export: &Export) -> io::Result<()> {
        loop {
            let req = Request::read(&mut self.reader)?;
            log::debug!(
                "request: cmd={} handle={:02x?} offset={} length={}",
                req.command,
                req.handle,
                req.offset,
                req.length
            );

            match req.command {
                NBD_CMD_READ => self.handle_read(export, &req)?,
                NBD_CMD_WRITE => self.handle_write(export, &req)?,
                NBD_CMD_DISC => {
                    log::info!("client requested disconnect");
                    return Ok(());
                }
                // FLUSH acknowledges without promising durability; TRIM
                // is a no-op.
                NBD_CMD_FLUSH | NBD_CMD_TRIM => {
                    write_simple_reply(&mut self.writer, req.handle, NBD_ERR_NONE, &[])?;
                }
                other => {
                    log::warn!("unknown command: {other}");
                    write_simple_reply(&mut self.writer, req.handle, NBD_ERR_INVAL, &[])?;
                }
            }
        }
    }

    fn handle_read(&mut self, export: &Export, req: &Request) -> io::Result<()> {
        if req.offset + req.length as u64 > export.size {
            return write_simple_reply(&mut self.writer, req.handle, NBD_ERR_INVAL, &[]);
        }

        let mut data = vec![0u8; req.length as usize];
        let mut filled = 0;
        let mut failed = false;
        while filled < data.len() {
            match export.reader.read_at(&mut data[filled..], req.offset + filled as u64) {
                Ok(0) => break, // short read: the tail stays zero
                Ok(n) => filled += n,
                Err(e) => {
                    log::error!("read error at offset {}: {e}", req.offset);
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            write_simple_reply(&mut self.writer, req.handle, NBD_ERR_IO, &[])
        } else {
            write_simple_reply(&mut self.writer, req.handle, NBD_ERR_NONE, &data)
        }
    }

    fn handle_write(&mut self, export: &Export, req: &Request) -> io::Result<()> {
        let Some(writer) = export.writer.as_ref() else {
            self.drain(req.length as u64)?;
            return write_simple_reply(&mut self.writer, req.handle, NBD_ERR_PERM, &[]);
        };

        if req.offset + req.length as u64 > export.size {
            self.drain(req.length as u64)?;
            return write_simple_reply(&mut self.writer, req.handle, NBD_ERR_INVAL, &[]);
        }

        let mut data = vec![0u8; req.length as usize];
        self.reader.read_exact(&mut data)?;

        match writer.write_all_at(&data, req.offset) {
            Ok(()) => write_simple_reply(&mut self.writer, req.handle, NBD_ERR_NONE, &[]),
            Err(e) => {
                log::error!("write error at offset {}: {e}", req.offset);
                write_simple_reply(&mut self.writer, req.handle, NBD_ERR_IO, &[])
            }
        }
    }

    /// Consume and discard a request body that cannot be applied.
    fn drain(&mut self, length: u64) -> io::Result<()> {
        io::copy(&mut (&mut self.reader).take(length), &mut io::sink())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{FileBackend, MemBackend};
    use byteorder::WriteBytesExt;
    use std::time::Duration;

    fn start_server(exports: Vec<Export>) -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nbd.sock");
        // Keep the tempdir alive for the process.
        std::mem::forget(dir);

        let mut server = Server::new(&path);
        for e in exports {
            server.add_export(e).unwrap();
        }
        thread::spawn(move || {
            let _ = server.serve();
        });

        for _ in 0..100 {
            if UnixStream::connect(&path).is_ok() {
                return path;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("server did not come up");
    }

    fn connect(path: &PathBuf) -> UnixStream {
        UnixStream::connect(path).unwrap()
    }

    fn read_greeting(stream: &mut UnixStream) -> u16 {
        let magic = stream.read_u64::<BigEndian>().unwrap();
        assert_eq!(magic, NBD_MAGIC);
        let opts = stream.read_u64::<BigEndian>().unwrap();
        assert_eq!(opts, NBD_OPTS_MAGIC);
        stream.read_u16::<BigEndian>().unwrap()
    }

    fn send_option(stream: &mut UnixStream, option: u32, data: &[u8]) {
        stream.write_u64::<BigEndian>(NBD_OPTS_MAGIC).unwrap();
        stream.write_u32::<BigEndian>(option).unwrap();
        stream.write_u32::<BigEndian>(data.len() as u32).unwrap();
        stream.write_all(data).unwrap();
    }

    fn send_request(stream: &mut UnixStream, cmd: u16, handle: u64, offset: u64, length: u32) {
        stream.write_u32::<BigEndian>(NBD_REQUEST_MAGIC).unwrap();
        stream.write_u16::<BigEndian>(0).unwrap();
        stream.write_u16::<BigEndian>(cmd).unwrap();
        stream.write_u64::<BigEndian>(handle).unwrap();
        stream.write_u64::<BigEndian>(offset).unwrap();
        stream.write_u32::<BigEndian>(length).unwrap();
    }

    fn read_simple_reply(stream: &mut UnixStream, payload: usize) -> (u32, u64, Vec<u8>) {
        let magic = stream.read_u32::<BigEndian>().unwrap();
        assert_eq!(magic, NBD_SIMPLE_REPLY_MAGIC);
        let error = stream.read_u32::<BigEndian>().unwrap();
        let handle = stream.read_u64::<BigEndian>().unwrap();
        let mut data = vec![0u8; if error == 0 { payload } else { 0 }];
        stream.read_exact(&mut data).unwrap();
        (error, handle, data)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_export_name_negotiation_and_read() {
        let data = pattern(8192);
        let path = start_server(vec![Export {
            name: "export".to_string(),
            size: 8192,
            reader: Arc::new(MemBackend::new(data.clone())),
            writer: None,
        }]);

        let mut stream = connect(&path);
        let flags = read_greeting(&mut stream);
        assert_ne!(flags & NBD_FLAG_FIXED_NEWSTYLE, 0);
        assert_ne!(flags & NBD_FLAG_NO_ZEROES, 0);

        // Fixed newstyle + no-zeroes client.
        stream.write_u32::<BigEndian>(3).unwrap();
        send_option(&mut stream, NBD_OPT_EXPORT_NAME, b"export");

        let size = stream.read_u64::<BigEndian>().unwrap();
        assert_eq!(size, 8192);
        let tflags = stream.read_u16::<BigEndian>().unwrap();
        assert_ne!(tflags & NBD_FLAG_HAS_FLAGS, 0);
        assert_ne!(tflags & NBD_FLAG_READ_ONLY, 0);

        send_request(&mut stream, NBD_CMD_READ, 0x1122334455667788, 0, 4096);
        let (error, handle, got) = read_simple_reply(&mut stream, 4096);
        assert_eq!(error, NBD_ERR_NONE);
        assert_eq!(handle, 0x1122334455667788);
        assert_eq!(got, &data[..4096]);

        // Out-of-range read.
        send_request(&mut stream, NBD_CMD_READ, 7, 8000, 4096);
        let (error, _, _) = read_simple_reply(&mut stream, 0);
        assert_eq!(error, NBD_ERR_INVAL);

        // Write on a read-only export drains the payload and fails EPERM.
        send_request(&mut stream, NBD_CMD_WRITE, 8, 0, 4);
        stream.write_all(&[1, 2, 3, 4]).unwrap();
        let (error, _, _) = read_simple_reply(&mut stream, 0);
        assert_eq!(error, NBD_ERR_PERM);

        // Flush and trim are acknowledged no-ops.
        send_request(&mut stream, NBD_CMD_FLUSH, 9, 0, 0);
        assert_eq!(read_simple_reply(&mut stream, 0).0, NBD_ERR_NONE);
        send_request(&mut stream, NBD_CMD_TRIM, 10, 0, 512);
        assert_eq!(read_simple_reply(&mut stream, 0).0, NBD_ERR_NONE);

        send_request(&mut stream, NBD_CMD_DISC, 11, 0, 0);
    }

    #[test]
    fn test_go_and_list_options() {
        let path = start_server(vec![
            Export {
                name: "first".to_string(),
                size: 4096,
                reader: Arc::new(MemBackend::new(pattern(4096))),
                writer: None,
            },
            Export {
                name: "second".to_string(),
                size: 1024,
                reader: Arc::new(MemBackend::new(pattern(1024))),
                writer: None,
            },
        ]);

        let mut stream = connect(&path);
        read_greeting(&mut stream);
        stream.write_u32::<BigEndian>(3).unwrap();

        // LIST names both exports, then acks.
        send_option(&mut stream, NBD_OPT_LIST, &[]);
        let mut names = Vec::new();
        loop {
            let magic = stream.read_u64::<BigEndian>().unwrap();
            assert_eq!(magic, NBD_OPT_REPLY_MAGIC);
            let _option = stream.read_u32::<BigEndian>().unwrap();
            let reply_type = stream.read_u32::<BigEndian>().unwrap();
            let len = stream.read_u32::<BigEndian>().unwrap() as usize;
            let mut data = vec![0u8; len];
            stream.read_exact(&mut data).unwrap();
            if reply_type == NBD_REP_ACK {
                break;
            }
            assert_eq!(reply_type, NBD_REP_SERVER);
            names.push(String::from_utf8_lossy(&data[4..]).into_owned());
        }
        assert_eq!(names, ["first", "second"]);

        // GO with an empty name falls back to the first export.
        send_option(&mut stream, NBD_OPT_GO, &[0, 0, 0, 0, 0, 0]);
        let mut export_size = 0u64;
        loop {
            let magic = stream.read_u64::<BigEndian>().unwrap();
            assert_eq!(magic, NBD_OPT_REPLY_MAGIC);
            let _option = stream.read_u32::<BigEndian>().unwrap();
            let reply_type = stream.read_u32::<BigEndian>().unwrap();
            let len = stream.read_u32::<BigEndian>().unwrap() as usize;
            let mut data = vec![0u8; len];
            stream.read_exact(&mut data).unwrap();
            if reply_type == NBD_REP_ACK {
                break;
            }
            assert_eq!(reply_type, NBD_REP_INFO);
            if BigEndian::read_u16(&data[0..2]) == NBD_INFO_EXPORT {
                export_size = BigEndian::read_u64(&data[2..10]);
            }
        }
        assert_eq!(export_size, 4096);

        // Transmission works after GO.
        send_request(&mut stream, NBD_CMD_READ, 1, 0, 16);
        let (error, _, got) = read_simple_reply(&mut stream, 16);
        assert_eq!(error, NBD_ERR_NONE);
        assert_eq!(got, pattern(4096)[..16]);
    }

    #[test]
    fn test_abort_and_unknown_option() {
        let path = start_server(vec![Export {
            name: "export".to_string(),
            size: 512,
            reader: Arc::new(MemBackend::new(vec![0u8; 512])),
            writer: None,
        }]);

        let mut stream = connect(&path);
        read_greeting(&mut stream);
        stream.write_u32::<BigEndian>(3).unwrap();

        // An unsupported option is rejected, not fatal.
        send_option(&mut stream, 0x999, &[]);
        let magic = stream.read_u64::<BigEndian>().unwrap();
        assert_eq!(magic, NBD_OPT_REPLY_MAGIC);
        let _opt = stream.read_u32::<BigEndian>().unwrap();
        let reply_type = stream.read_u32::<BigEndian>().unwrap();
        let _len = stream.read_u32::<BigEndian>().unwrap();
        assert_eq!(reply_type, NBD_REP_ERR_UNSUP);

        // Abort is acked and the connection closes without transmission.
        send_option(&mut stream, NBD_OPT_ABORT, &[]);
        let magic = stream.read_u64::<BigEndian>().unwrap();
        assert_eq!(magic, NBD_OPT_REPLY_MAGIC);
        let _opt = stream.read_u32::<BigEndian>().unwrap();
        let reply_type = stream.read_u32::<BigEndian>().unwrap();
        assert_eq!(reply_type, NBD_REP_ACK);
    }

    /// Writing plaintext through an encrypting export: the client reads
    /// its own bytes back while the backing file holds ciphertext.
    #[test]
    fn test_write_through_xts_export() {
        use crate::xts::{XtsCipher, XtsReader, XtsWriter};
        use std::io::Write as _;

        let mut temp = tempfile::NamedTempFile::new().unwrap();
        temp.write_all(&vec![0u8; 4096]).unwrap();
        let backend = Arc::new(FileBackend::open_rw(temp.path()).unwrap());

        let key: Vec<u8> = (0..32).collect();
        let cipher = Arc::new(XtsCipher::new(&key, 512, 0).unwrap());
        let reader = Arc::new(XtsReader::new(backend.clone(), cipher.clone(), 4096));
        let writer = Arc::new(XtsWriter::new(backend.clone(), cipher, 4096));

        let path = start_server(vec![Export {
            name: "crypt".to_string(),
            size: 4096,
            reader,
            writer: Some(writer),
        }]);

        let mut stream = connect(&path);
        read_greeting(&mut stream);
        stream.write_u32::<BigEndian>(3).unwrap();
        send_option(&mut stream, NBD_OPT_EXPORT_NAME, b"crypt");
        let _ = stream.read_u64::<BigEndian>().unwrap();
        let _ = stream.read_u16::<BigEndian>().unwrap();

        let plaintext = pattern(512);
        send_request(&mut stream, NBD_CMD_WRITE, 1, 0, 512);
        stream.write_all(&plaintext).unwrap();
        assert_eq!(read_simple_reply(&mut stream, 0).0, NBD_ERR_NONE);

        // The client sees its plaintext back.
        send_request(&mut stream, NBD_CMD_READ, 2, 0, 512);
        let (error, _, got) = read_simple_reply(&mut stream, 512);
        assert_eq!(error, NBD_ERR_NONE);
        assert_eq!(got, plaintext);

        // The backing file holds ciphertext.
        let mut raw = vec![0u8; 512];
        backend.read_exact_at(&mut raw, 0).unwrap();
        assert_ne!(raw, plaintext);
    }

    #[test]
    fn test_read_write_roundtrip() {
        use std::io::Write as _;
        let mut temp = tempfile::NamedTempFile::new().unwrap();
        temp.write_all(&vec![0u8; 4096]).unwrap();
        let backend = Arc::new(FileBackend::open_rw(temp.path()).unwrap());

        let path = start_server(vec![Export {
            name: "rw".to_string(),
            size: 4096,
            reader: backend.clone(),
            writer: Some(backend),
        }]);

        let mut stream = connect(&path);
        read_greeting(&mut stream);
        stream.write_u32::<BigEndian>(3).unwrap();
        send_option(&mut stream, NBD_OPT_EXPORT_NAME, b"rw");
        let _size = stream.read_u64::<BigEndian>().unwrap();
        let tflags = stream.read_u16::<BigEndian>().unwrap();
        assert_eq!(tflags & NBD_FLAG_READ_ONLY, 0);

        let payload = pattern(512);
        send_request(&mut stream, NBD_CMD_WRITE, 1, 512, 512);
        stream.write_all(&payload).unwrap();
        let (error, _, _) = read_simple_reply(&mut stream, 0);
        assert_eq!(error, NBD_ERR_NONE);

        send_request(&mut stream, NBD_CMD_READ, 2, 512, 512);
        let (error, _, got) = read_simple_reply(&mut stream, 512);
        assert_eq!(error, NBD_ERR_NONE);
        assert_eq!(got, payload);
    }
}
