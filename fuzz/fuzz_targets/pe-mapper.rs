#![no_main]
#[macro_use] extern crate libfuzzer_sys;
extern crate pe_mapper;

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = pe_mapper::pe::PeImage::parse(data);
});
