// Copyright (c) 2026 Myco
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Pre-generate a node's `node_identity.key` and print its hex node id, so
//! operators can seed other nodes' peer books before first boot. Honors
//! `MYCO_KEY_PASSPHRASE` exactly as `Node::bootstrap` does.

use anyhow::Result;
use myco::core::security::identity::Identity;

fn main() -> Result<()> {
    let data_dir = std::env::args().nth(1).unwrap_or_else(|| "data".to_string());
    std::fs::create_dir_all(&data_dir)?;

    let identity = Identity::load_or_create(&data_dir)?;
    println!("{}", identity.node_id().to_hex());
    Ok(())
}
