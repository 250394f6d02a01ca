//! Handle magnet link
use std::ops::{Deref, DerefMut};

use magnet_url::Magnet as Magnet_;

use crate::{error::Error, torrent::InfoHash};

#[derive(Debug, Clone)]
pub struct Magnet(pub Magnet_);

impl From<Magnet_> for Magnet {
    fn from(value: Magnet_) -> Self {
        Self(value)
    }
}

impl Deref for Magnet {
    type Target = Magnet_;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Magnet {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Magnet {
    pub fn new(magnet_url: &str) -> Result<Self, Error> {
        Ok(Self(
            Magnet_::new(magnet_url).map_err(|_| Error::MagnetLinkInvalid)?,
        ))
    }

    /// The name comes URL encoded, and it is also optional.
    pub fn parse_dn(&self) -> String {
        if let Some(dn) = &self.0.dn {
            if let Ok(dn) = urlencoding::decode(dn) {
                return dn.to_string();
            }
        }
        "Unknown".to_owned()
    }

    /// Transform the "xt" field from hex to the 20-byte info hash.
    pub fn parse_xt_infohash(&self) -> Result<InfoHash, Error> {
        let xt = self.0.xt.as_ref().ok_or(Error::MagnetNoInfoHash)?;
        let bytes =
            hex::decode(xt).map_err(|_| Error::MagnetNoInfoHash)?;
        bytes.try_into()
    }

    /// The "tr" fields, URL decoded, keeping only the protocols we can
    /// announce to.
    pub fn parse_trackers(&self) -> Vec<String> {
        self.0
            .tr
            .iter()
            .filter_map(|tr| urlencoding::decode(tr).ok())
            .map(|tr| tr.to_string())
            .filter(|tr| {
                tr.starts_with("udp://")
                    || tr.starts_with("http://")
                    || tr.starts_with("https://")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_big_buck_bunny() {
        let mstr = "magnet:?xt=urn:btih:\
                    dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&dn=Big+Buck+\
                    Bunny&tr=udp%3A%2F%2Fexplodie.org%3A6969&tr=udp%3A%2F%\
                    2Ftracker.coppersurfer.tk%3A6969&tr=udp%3A%2F%2Ftracker.\
                    empire-js.us%3A1337&tr=wss%3A%2F%2Ftracker.btorrent.xyz";
        let magnet = Magnet::new(mstr).unwrap();

        let trackers = magnet.parse_trackers();
        assert!(!trackers.is_empty());
        // the wss tracker is not a protocol we announce to
        assert_eq!(trackers.len(), 3);
        assert_eq!(trackers[0], "udp://explodie.org:6969");

        let info_hash = magnet.parse_xt_infohash().unwrap();
        assert_eq!(info_hash[0], 0xdd);
        assert_eq!(info_hash[19], 0x1c);

        assert_eq!(magnet.parse_dn(), "Big+Buck+Bunny");
    }

    #[test]
    fn unknown_name_fallback() {
        let mstr = "magnet:?xt=urn:btih:\
                    dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&tr=udp%3A%2F%\
                    2Fexplodie.org%3A6969";
        let magnet = Magnet::new(mstr).unwrap();
        assert_eq!(magnet.parse_dn(), "Unknown");
    }
}
