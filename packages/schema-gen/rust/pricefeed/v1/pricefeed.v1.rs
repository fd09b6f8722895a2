// @generated
// This file is @generated by prost-build.
/** Stream registration request.

 For SendPosNewPrice the message carries the position key
 "<clientId>-<symbol>"; SendPrice ignores it.
*/
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct Conn {
    #[prost(string, tag="1")]
    pub message: ::prost::alloc::string::String,
}
/** A priced quote for one symbol.
*/
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Price {
    /** Non-zero quote identifier. Zero is reserved for "no data".
*/
    #[prost(uint64, tag="1")]
    pub uuid: u64,
    #[prost(string, tag="2")]
    pub symbol: ::prost::alloc::string::String,
    #[prost(double, tag="3")]
    pub bid: f64,
    #[prost(double, tag="4")]
    pub ask: f64,
}
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct ValidResponse {
    #[prost(bool, tag="1")]
    pub is_valid: bool,
}
include!("pricefeed.v1.tonic.rs");
// @@protoc_insertion_point(module)
