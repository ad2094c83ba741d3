//! Minimal in-memory FTP server for tests: one thread per control
//! connection, passive mode only, unix-style `LIST` output.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Debug)]
struct Tree {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}
impl Tree {
    fn children(&self, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" { "/".to_string() } else { format!("{dir}/") };
        let child = |path: &str| {
            path.strip_prefix(prefix.as_str())
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .is_some()
        };
        let dirs = self.dirs.iter().filter(|path| child(path.as_str())).map(|path| listing_line(path, None));
        let files = self.files.iter().filter(|(path, _)| child(path.as_str())).map(|(path, data)| listing_line(path, Some(data.len())));
        dirs.chain(files).collect()
    }
}

fn listing_line(path: &str, size: Option<usize>) -> String {
    let name = path.rsplit('/').next().unwrap_or_default();
    match size {
        Some(size) => format!("-rw-r--r-- 1 owner group {size} Jan 01 12:00 {name}"),
        None => format!("drwxr-xr-x 2 owner group 0 Jan 01 12:00 {name}"),
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

pub(super) struct FakeFtpServer {
    port: u16,
    tree: Arc<Mutex<Tree>>,
}
impl FakeFtpServer {
    pub(super) fn start(username: &str, password: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let tree = Arc::new(Mutex::new(Tree { files: BTreeMap::new(), dirs: BTreeSet::from(["/".to_string()]) }));
        let credentials = (username.to_string(), password.to_string());
        let shared = Arc::clone(&tree);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let (tree, credentials) = (Arc::clone(&shared), credentials.clone());
                thread::spawn(move || Session::new(stream, tree, credentials).serve());
            }
        });
        Self { port, tree }
    }

    pub(super) fn port(&self) -> u16 {
        self.port
    }

    pub(super) fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.tree.lock().unwrap().files.get(path).cloned()
    }

    pub(super) fn mkdir(&self, path: &str) {
        self.tree.lock().unwrap().dirs.insert(path.to_string());
    }
}

struct Session {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    tree: Arc<Mutex<Tree>>,
    credentials: (String, String),
    user: String,
    cwd: String,
    passive: Option<TcpListener>,
}
impl Session {
    fn new(stream: TcpStream, tree: Arc<Mutex<Tree>>, credentials: (String, String)) -> Self {
        Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
            tree,
            credentials,
            user: String::new(),
            cwd: "/".to_string(),
            passive: None,
        }
    }

    fn reply(&mut self, line: &str) {
        let _ = self.writer.write_all(format!("{line}\r\n").as_bytes());
    }

    fn absolute(&self, path: &str) -> String {
        let joined = match path {
            "" => self.cwd.clone(),
            path if path.starts_with('/') => path.to_string(),
            path if self.cwd == "/" => format!("/{path}"),
            path => format!("{}/{path}", self.cwd),
        };
        match joined.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        }
    }

    fn has_dir(&self, path: &str) -> bool {
        self.tree.lock().unwrap().dirs.contains(path)
    }

    fn remove_file(&self, path: &str) -> bool {
        self.tree.lock().unwrap().files.remove(path).is_some()
    }

    /// Failed transfers leave the passive listener alone: the client has
    /// already connected to it and only then reads the error reply.
    fn data_connection(&mut self) -> Option<TcpStream> {
        let listener = self.passive.take()?;
        listener.accept().ok().map(|(stream, _)| stream)
    }

    fn serve(mut self) {
        self.reply("220 fake ftp ready");
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).unwrap_or(0) == 0 {
                break;
            }
            let line = line.trim_end();
            let (command, argument) = line.split_once(' ').unwrap_or((line, ""));
            let path = self.absolute(argument);
            match command.to_ascii_uppercase().as_str() {
                "USER" => {
                    self.user = argument.to_string();
                    self.reply("331 password required");
                },
                "PASS" => match self.user == self.credentials.0 && argument == self.credentials.1 {
                    true => self.reply("230 logged in"),
                    false => self.reply("530 login incorrect"),
                },
                "TYPE" | "NOOP" => self.reply("200 ok"),
                "PWD" => {
                    let reply = format!("257 \"{}\" is the current directory", self.cwd);
                    self.reply(&reply);
                },
                "CWD" => match self.has_dir(&path) {
                    true => {
                        self.cwd = path;
                        self.reply("250 directory changed");
                    },
                    false => self.reply("550 no such directory"),
                },
                "PASV" => {
                    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
                    let port = listener.local_addr().unwrap().port();
                    self.passive = Some(listener);
                    let reply = format!("227 Entering Passive Mode (127,0,0,1,{},{})", port / 256, port % 256);
                    self.reply(&reply);
                },
                "SIZE" => {
                    let size = self.tree.lock().unwrap().files.get(&path).map(Vec::len);
                    match size {
                        Some(size) => self.reply(&format!("213 {size}")),
                        None => self.reply("550 not a plain file"),
                    }
                },
                "RETR" => {
                    let data = self.tree.lock().unwrap().files.get(&path).cloned();
                    let Some(data) = data else {
                        self.reply("550 no such file");
                        continue;
                    };
                    self.reply("150 opening data connection");
                    if let Some(mut stream) = self.data_connection() {
                        let _ = stream.write_all(&data);
                    }
                    self.reply("226 transfer complete");
                },
                "STOR" => {
                    if !self.has_dir(parent_of(&path)) {
                        self.reply("550 no such directory");
                        continue;
                    }
                    self.reply("150 opening data connection");
                    let mut data = Vec::new();
                    if let Some(mut stream) = self.data_connection() {
                        let _ = stream.read_to_end(&mut data);
                    }
                    self.tree.lock().unwrap().files.insert(path, data);
                    self.reply("226 transfer complete");
                },
                "LIST" => {
                    let lines = {
                        let tree = self.tree.lock().unwrap();
                        if tree.dirs.contains(&path) {
                            Some(tree.children(&path))
                        } else {
                            tree.files.get(&path).map(|data| vec![listing_line(&path, Some(data.len()))])
                        }
                    };
                    let Some(lines) = lines else {
                        self.reply("550 no such directory");
                        continue;
                    };
                    self.reply("150 here comes the listing");
                    if let Some(mut stream) = self.data_connection() {
                        let _ = stream.write_all(format!("total {}\r\n", lines.len()).as_bytes());
                        for line in lines {
                            let _ = stream.write_all(format!("{line}\r\n").as_bytes());
                        }
                    }
                    self.reply("226 listing sent");
                },
                "MKD" => {
                    let created = {
                        let mut tree = self.tree.lock().unwrap();
                        let free = !tree.dirs.contains(&path) && !tree.files.contains_key(&path);
                        free && tree.dirs.contains(parent_of(&path)) && tree.dirs.insert(path.clone())
                    };
                    match created {
                        true => self.reply(&format!("257 \"{path}\" created")),
                        false => self.reply("550 cannot create directory"),
                    }
                },
                "RMD" => {
                    let removed = {
                        let mut tree = self.tree.lock().unwrap();
                        tree.dirs.contains(&path) && tree.children(&path).is_empty() && tree.dirs.remove(&path)
                    };
                    match removed {
                        true => self.reply("250 directory removed"),
                        false => self.reply("550 cannot remove directory"),
                    }
                },
                "DELE" => match self.remove_file(&path) {
                    true => self.reply("250 file deleted"),
                    false => self.reply("550 no such file"),
                },
                "QUIT" => {
                    self.reply("221 goodbye");
                    break;
                },
                _ => self.reply("502 command not implemented"),
            }
        }
    }
}
