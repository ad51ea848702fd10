//! Shared test fixtures: a scripted stdio server standing in for a real
//! managed endpoint.

use crate::config::ServerDescriptor;

/// Shell one-liner that answers every request (any line carrying an id)
/// with a canned result satisfying initialize, tools/list, prompts/list,
/// and tools/call alike; notifications are ignored.
pub(crate) const FAKE_SERVER: &str = r#"while read line; do
    id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
    if [ -n "$id" ]; then
        printf '{"jsonrpc":"2.0","id":%s,"result":{"serverInfo":{"name":"fake","version":"0"},"protocolVersion":"2024-11-05","tools":[{"name":"ping"}],"prompts":[],"content":{"ok":true},"isError":false}}\n' "$id"
    fi
done"#;

/// Descriptor running [`FAKE_SERVER`] under `sh -c`.
pub(crate) fn fake_server_descriptor(name: &str) -> ServerDescriptor {
    let mut descriptor = ServerDescriptor::stdio(name, "sh");
    descriptor.args = vec!["-c".to_string(), FAKE_SERVER.to_string()];
    descriptor.timeout_ms = 5_000;
    descriptor
}

/// Descriptor whose command cannot be spawned.
pub(crate) fn broken_descriptor(name: &str) -> ServerDescriptor {
    ServerDescriptor::stdio(name, "/this/command/does/not/exist-cipher")
}
