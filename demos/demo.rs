use kvrndz::tcp::{Client, Server};
use kvrndz::{AddressStore, ClientConfig, MemoryStore, ServerConfig, Timeout};
use std::error::Error;
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let key = "demo/primary";
    let timeout = Timeout::After(Duration::from_secs(5));

    // a server that has since gone away
    store.create(key, "127.0.0.1:1", "stale")?;

    let t = {
        let store = store.clone();
        thread::spawn(move || {
            let config = ClientConfig::new(key, 0, "hello", timeout)
                .with_advertise_host("127.0.0.1")
                .verbose(true);
            let mut c = Client::new(store, config).unwrap();
            let mut conn = c.connect().unwrap();
            conn.stream.write_all(b"hello").unwrap();
        })
    };

    while store.list("demo")?.len() < 2 {
        thread::sleep(Duration::from_millis(100));
    }

    let config = ServerConfig::new(key, 0, "hello", timeout)
        .with_advertise_host("127.0.0.1")
        .verbose(true);
    let (s, _) = Server::start(store, config)?;
    let (mut stream, peer) = s.accept()?;

    let mut buf = [0; 5];
    stream.read_exact(&mut buf)?;
    println!("{} says {}", peer, String::from_utf8_lossy(&buf));

    t.join().unwrap();

    Ok(())
}
