//! Streaming zlib bound to the SPDY/1 preset dictionary.
//!
//! One compressor and one decompressor per session; their stream
//! state is shared by every header block the session sends or
//! receives, so blocks must be processed strictly in frame order.

use flate2::{
    Compress, Compression, Decompress, DecompressError, FlushCompress,
    FlushDecompress,
};

/// The SPDY/1 header-compression dictionary. It seeds the zlib
/// sliding window so small header blocks compress well, and it must
/// be byte-identical on both ends to interoperate.
pub const DICTIONARY: &[u8] =
    "optionsgetheadpostputdeletetraceacceptaccept-charsetaccept-encodinga\
     ccept-languageauthorizationexpectfromhostif-modified-sinceif-matchif\
     -none-matchif-rangeif-unmodifiedsincemax-forwardsproxy-authorization\
     rangerefererteuser-agent10010120020120220320420520630030130230330430\
     53063074004014024034044054064074084094104114124134144154164175005015\
     02503504505accept-rangesageetaglocationproxy-authenticatepublicretry\
     -afterservervarywarningwww-authenticateallowcontent-basecontent-enco\
     dingcache-controlconnectiondatetrailertransfer-encodingupgradeviawar\
     ningcontent-languagecontent-lengthcontent-locationcontent-md5content\
     -rangecontent-typeetagexpireslast-modifiedset-cookieMondayTuesdayWed\
     nesdayThursdayFridaySaturdaySundayJanFebMarAprMayJunJulAugSepOctNovD\
     ecchunkedtext/htmlimage/pngimage/jpgimage/gifapplication/xmlapplicat\
     ion/xhtmltext/plainpublicmax-agecharset=iso-8859-1utf-8gzipdeflateHT\
     TP/1.1statusversionurl".as_bytes();

/// Deflate stream with the preset dictionary installed before the
/// first byte goes through.
pub struct Compressor {
    raw: Compress,
    dict_set: bool,
}

impl Compressor {
    pub fn new() -> Compressor {
        Compressor {
            raw: Compress::new(Compression::default(), true),
            dict_set: false,
        }
    }

    /// Compress one header block, sync-flushed so the peer can decode
    /// it without waiting for another frame.
    pub fn compress(&mut self, input: &[u8]) -> Vec<u8> {
        if !self.dict_set {
            self.dict_set = true;
            self.raw.set_dictionary(DICTIONARY)
                .expect("preset dictionary is accepted before any input");
        }
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let mut consumed = 0;
        loop {
            out.reserve(128);
            let before = self.raw.total_in();
            self.raw
                .compress_vec(&input[consumed..], &mut out,
                    FlushCompress::Sync)
                .expect("deflate does not fail on valid state");
            consumed += (self.raw.total_in() - before) as usize;
            // The flush is complete once everything is consumed and
            // there is still room to spare in the output.
            if consumed == input.len() && out.len() < out.capacity() {
                return out;
            }
        }
    }
}

/// Inflate stream; the preset dictionary is installed when the
/// stream first asks for it.
pub struct Decompressor {
    raw: Decompress,
}

impl Decompressor {
    pub fn new() -> Decompressor {
        Decompressor { raw: Decompress::new(true) }
    }

    pub fn decompress(&mut self, input: &[u8])
        -> Result<Vec<u8>, DecompressError>
    {
        let mut out = Vec::with_capacity(input.len() * 4 + 64);
        let mut consumed = 0;
        loop {
            out.reserve(256);
            let before = self.raw.total_in();
            match self.raw.decompress_vec(&input[consumed..], &mut out,
                FlushDecompress::Sync)
            {
                Ok(_) => {
                    consumed += (self.raw.total_in() - before) as usize;
                    if consumed == input.len()
                        && out.len() < out.capacity()
                    {
                        return Ok(out);
                    }
                }
                Err(e) => {
                    if e.needs_dictionary().is_none() {
                        return Err(e);
                    }
                    consumed += (self.raw.total_in() - before) as usize;
                    self.raw.set_dictionary(DICTIONARY)?;
                }
            }
        }
    }
}
