/// ErrorModel : Error payload returned by vmrest for every non-2xx answer
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorModel {
    #[serde(rename = "Code", default)]
    pub code: i32,
    #[serde(rename = "Message", default)]
    pub message: String,
}

impl ErrorModel {
    pub fn new(code: i32, message: String) -> ErrorModel {
        ErrorModel { code, message }
    }
}
