// Settings key paths
//
// All persisted state lives under `bt_mesh/`. Indexes and addresses in a
// path are lower-case hex without padding, e.g. `bt_mesh/RPL/1a` or
// `bt_mesh/s/100/pub` for model 0 of element 1.

pub const ROOT: &str = "bt_mesh/";

pub const NET: &str = "bt_mesh/Net";
pub const IV: &str = "bt_mesh/IV";
pub const SEQ: &str = "bt_mesh/Seq";
pub const HB_PUB: &str = "bt_mesh/HBPub";
pub const CFG: &str = "bt_mesh/Cfg";
pub const CDB_NET: &str = "bt_mesh/cdb/Net";

pub fn rpl(src: u16) -> String {
    format!("bt_mesh/RPL/{:x}", src)
}

pub fn net_key(net_idx: u16) -> String {
    format!("bt_mesh/NetKey/{:x}", net_idx)
}

pub fn app_key(app_idx: u16) -> String {
    format!("bt_mesh/AppKey/{:x}", app_idx)
}

pub fn label(idx: u16) -> String {
    format!("bt_mesh/Va/{:x}", idx)
}

pub fn cdb_node(addr: u16) -> String {
    format!("bt_mesh/cdb/Node/{:x}", addr)
}

pub fn cdb_subnet(net_idx: u16) -> String {
    format!("bt_mesh/cdb/Subnet/{:x}", net_idx)
}

pub fn cdb_app_key(app_idx: u16) -> String {
    format!("bt_mesh/cdb/AppKey/{:x}", app_idx)
}

/// Per-model record kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelRecord {
    Bind,
    Sub,
    Pub,
    Data(Option<String>),
}

impl ModelRecord {
    fn suffix(&self) -> String {
        match self {
            ModelRecord::Bind => "bind".to_string(),
            ModelRecord::Sub => "sub".to_string(),
            ModelRecord::Pub => "pub".to_string(),
            ModelRecord::Data(None) => "data".to_string(),
            ModelRecord::Data(Some(name)) => format!("data/{}", name),
        }
    }
}

/// `bt_mesh/s/<elem<<8|mod>/<record>` for SIG models, `v` for vendor models
pub fn model(vnd: bool, elem_idx: u8, mod_idx: u8, record: &ModelRecord) -> String {
    let id = ((elem_idx as u16) << 8) | mod_idx as u16;
    format!(
        "bt_mesh/{}/{:x}/{}",
        if vnd { "v" } else { "s" },
        id,
        record.suffix()
    )
}

/// Parsed settings path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsKey {
    Net,
    Iv,
    Seq,
    HbPub,
    Cfg,
    Rpl(u16),
    NetKey(u16),
    AppKey(u16),
    Label(u16),
    Model {
        vnd: bool,
        elem_idx: u8,
        mod_idx: u8,
        record: ModelRecord,
    },
    CdbNet,
    CdbNode(u16),
    CdbSubnet(u16),
    CdbAppKey(u16),
}

fn hex16(s: &str) -> Option<u16> {
    u16::from_str_radix(s, 16).ok()
}

impl SettingsKey {
    pub fn parse(path: &str) -> Option<Self> {
        let rest = path.strip_prefix(ROOT)?;
        let parts: Vec<&str> = rest.split('/').collect();
        let key = match parts.as_slice() {
            ["Net"] => SettingsKey::Net,
            ["IV"] => SettingsKey::Iv,
            ["Seq"] => SettingsKey::Seq,
            ["HBPub"] => SettingsKey::HbPub,
            ["Cfg"] => SettingsKey::Cfg,
            ["RPL", src] => SettingsKey::Rpl(hex16(src)?),
            ["NetKey", idx] => SettingsKey::NetKey(hex16(idx)?),
            ["AppKey", idx] => SettingsKey::AppKey(hex16(idx)?),
            ["Va", idx] => SettingsKey::Label(hex16(idx)?),
            ["cdb", "Net"] => SettingsKey::CdbNet,
            ["cdb", "Node", addr] => SettingsKey::CdbNode(hex16(addr)?),
            ["cdb", "Subnet", idx] => SettingsKey::CdbSubnet(hex16(idx)?),
            ["cdb", "AppKey", idx] => SettingsKey::CdbAppKey(hex16(idx)?),
            [kind @ ("s" | "v"), id, record @ ..] => {
                let id = hex16(id)?;
                let record = match record {
                    ["bind"] => ModelRecord::Bind,
                    ["sub"] => ModelRecord::Sub,
                    ["pub"] => ModelRecord::Pub,
                    ["data"] => ModelRecord::Data(None),
                    ["data", name] => ModelRecord::Data(Some(name.to_string())),
                    _ => return None,
                };
                SettingsKey::Model {
                    vnd: *kind == "v",
                    elem_idx: (id >> 8) as u8,
                    mod_idx: id as u8,
                    record,
                }
            }
            _ => return None,
        };
        Some(key)
    }
}
