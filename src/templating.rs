//! Lazy `{{ token }}` resolution for SSH topology variables.
//!
//! Only tokens that actually appear in a template string are ever resolved —
//! each one may require a network round-trip, so the resolver never does
//! more work than the string demands.

use std::collections::HashMap;

use crate::error::TunmanResult;
use crate::remote::RemoteShellClient;

/// One `{{ name }}` occurrence found in a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub name: String,
    span: (usize, usize),
}

/// Scan `template` for `{{ name }}` occurrences, in order of appearance.
pub fn find_tokens(template: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let bytes = template.as_bytes();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            if let Some(end) = template[i..].find("}}") {
                let name = template[i + 2..i + end].trim().to_string();
                tokens.push(Token {
                    name,
                    span: (i, i + end + 2),
                });
                i += end + 2;
                continue;
            }
        }
        i += 1;
    }

    tokens
}

/// Builds the lazy token → resolver table for one host, then renders a
/// template against it.
///
/// Named tokens mirror `model.py`'s dictionary: `local_gw`, `remote_gw`,
/// `remote_interface_gw`, `remote_docker_host`, `remote_docker_container`
/// plus any `remote_interface_<name>` for a specific interface.
pub struct VariableResolver<'a> {
    local: RoutingTableSource<'a>,
    remote: &'a RemoteShellClient,
}

/// Abstracts over how the local routing table is obtained, so callers can
/// inject a pre-parsed table in tests instead of shelling out to `ip route`.
pub enum RoutingTableSource<'a> {
    Live,
    Fixed(&'a crate::network::RoutingTable),
}

impl<'a> VariableResolver<'a> {
    pub fn new(remote: &'a RemoteShellClient) -> Self {
        Self {
            local: RoutingTableSource::Live,
            remote,
        }
    }

    pub fn with_local_table(remote: &'a RemoteShellClient, table: &'a crate::network::RoutingTable) -> Self {
        Self {
            local: RoutingTableSource::Fixed(table),
            remote,
        }
    }

    async fn local_table(&self) -> TunmanResult<crate::network::RoutingTable> {
        match &self.local {
            RoutingTableSource::Fixed(table) => Ok((*table).clone()),
            RoutingTableSource::Live => {
                let output = tokio::process::Command::new("ip")
                    .arg("route")
                    .output()
                    .await?;
                crate::network::RoutingTable::parse(&String::from_utf8_lossy(&output.stdout))
            }
        }
    }

    async fn resolve_one(&self, name: &str) -> TunmanResult<String> {
        if let Some(iface) = name.strip_prefix("remote_interface_") {
            return self.remote.get_interface_ip(iface).await;
        }

        match name {
            "local_gw" => {
                let table = self.local_table().await?;
                Ok(table.gateway_interface_ip().to_string())
            }
            "remote_gw" => self.remote.resolve_remote_host().await,
            "remote_interface_gw" => self.remote.get_route_gateway().await,
            "remote_docker_host" => self.remote.get_docker_host_ip().await,
            "remote_docker_container" => {
                let iface = self.remote.get_first_non_loopback_interface().await?;
                self.remote.get_interface_ip(&iface).await
            }
            other => Err(crate::error::TunmanError::Parse(format!(
                "unknown template token: {other}"
            ))),
        }
    }

    /// Resolve every distinct token in `template` into a variables map, hand
    /// the whole map to `post_process` (which may mutate it in place), then
    /// substitute the (possibly adjusted) values back into the string.
    pub async fn render(
        &self,
        template: &str,
        post_process: Option<&(dyn Fn(&mut HashMap<String, String>) + Send + Sync)>,
    ) -> TunmanResult<String> {
        let tokens = find_tokens(template);
        if tokens.is_empty() {
            return Ok(template.to_string());
        }

        let mut variables: HashMap<String, String> = HashMap::new();
        for token in &tokens {
            if variables.contains_key(&token.name) {
                continue;
            }
            let resolved = self.resolve_one(&token.name).await?;
            variables.insert(token.name.clone(), resolved);
        }

        if let Some(post_process) = post_process {
            post_process(&mut variables);
        }

        let mut rendered = String::with_capacity(template.len());
        let mut cursor = 0;

        for token in &tokens {
            rendered.push_str(&template[cursor..token.span.0]);
            let value = variables.get(&token.name).map(String::as_str).unwrap_or("");
            rendered.push_str(value);
            cursor = token.span.1;
        }

        rendered.push_str(&template[cursor..]);
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteEndpoint, RemoteShellClient};

    #[test]
    fn finds_all_tokens_in_order() {
        let tokens = find_tokens("ssh -L {{ local_gw }}:80:{{ remote_gw }}:80");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].name, "local_gw");
        assert_eq!(tokens[1].name, "remote_gw");
    }

    #[test]
    fn tolerates_extra_whitespace() {
        let tokens = find_tokens("{{   remote_docker_host   }}");
        assert_eq!(tokens[0].name, "remote_docker_host");
    }

    #[test]
    fn no_tokens_returns_empty() {
        assert!(find_tokens("plain string, no templating").is_empty());
    }

    fn shell_client() -> RemoteShellClient {
        RemoteShellClient::new(RemoteEndpoint {
            user: "riotkit".to_string(),
            host: "127.0.0.1".to_string(),
            port: 22,
            key: None,
            key_passphrase: None,
            password: None,
        })
    }

    fn fixed_table() -> crate::network::RoutingTable {
        crate::network::RoutingTable::parse(
            "default via 10.0.0.1 dev eth0\n10.0.0.0/24 dev eth0 src 10.0.0.5\n",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn render_passes_no_tokens_template_through_untouched() {
        let client = shell_client();
        let table = fixed_table();
        let resolver = VariableResolver::with_local_table(&client, &table);

        let rendered = resolver.render("no templating here", None).await.unwrap();
        assert_eq!(rendered, "no templating here");
    }

    #[tokio::test]
    async fn post_processor_can_mutate_the_resolved_variables_map() {
        let client = shell_client();
        let table = fixed_table();
        let resolver = VariableResolver::with_local_table(&client, &table);

        let post_process = |vars: &mut HashMap<String, String>| {
            vars.insert("local_gw".to_string(), "overridden".to_string());
        };

        let rendered = resolver
            .render("gw={{ local_gw }}", Some(&post_process))
            .await
            .unwrap();

        assert_eq!(rendered, "gw=overridden");
    }
}
