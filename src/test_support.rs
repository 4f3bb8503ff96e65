use std::{fs, path::PathBuf};

use tempfile::TempDir;

use crate::{config::Config, harness::StdioHarness};

const FAKE_SERVER: &str = r#"echo "fake server ready" >&2
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"__SERVER_NAME__","version":"0.1.0"}}}\n' "$id" ;;
    *'"method":"notifications/initialized"'*)
      echo "client initialized" >&2 ;;
    *'"method":"tools/list"'*)
      __TOOLS_LIST__ ;;
    *'"method":"tools/call"'*)
      __TOOLS_CALL__ ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id" ;;
  esac
done
"#;

pub(crate) const TOOLS_LIST_OK: &str = r#"printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"get_system_info","description":"Get system information","inputSchema":{"type":"object"}},{"name":"list_services","description":"List services","inputSchema":{"type":"object"}}]}}\n' "$id""#;

pub(crate) const TOOLS_CALL_OK: &str = r#"printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"hostname: localhost\\nkernel: 6.1"}]}}\n' "$id""#;

/// Shell fake of an MCP stdio server, written to a temporary directory.
pub(crate) struct FakeServer {
    _dir: TempDir,
    pub(crate) script: PathBuf,
}

impl FakeServer {
    pub(crate) fn conforming(server_name: &str) -> Self {
        Self::with_handlers(server_name, TOOLS_LIST_OK, TOOLS_CALL_OK)
    }

    pub(crate) fn with_handlers(server_name: &str, tools_list: &str, tools_call: &str) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = dir.path().join("mcp-server.sh");
        let body = FAKE_SERVER
            .replace("__SERVER_NAME__", server_name)
            .replace("__TOOLS_LIST__", tools_list)
            .replace("__TOOLS_CALL__", tools_call);
        fs::write(&script, body).expect("write fake server");

        Self { _dir: dir, script }
    }

    pub(crate) fn start(&self) -> StdioHarness {
        StdioHarness::start("sh", [&self.script]).expect("fake server should launch")
    }

    pub(crate) fn config(&self, extra: &[(&str, &str)]) -> Config {
        let script = self.script.to_string_lossy().into_owned();
        Config::from_lookup(|key| {
            if let Some((_, value)) = extra.iter().find(|(name, _)| *name == key) {
                return Some(value.to_string());
            }
            match key {
                "MCP_SERVER_INTERPRETER" => Some("sh".to_string()),
                "MCP_SERVER_SCRIPT" => Some(script.clone()),
                "MCP_RESPONSE_TIMEOUT_MS" => Some("5000".to_string()),
                "MCP_SHUTDOWN_GRACE_MS" => Some("2000".to_string()),
                _ => None,
            }
        })
        .expect("test config")
    }
}
